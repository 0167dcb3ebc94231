use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use zs::{CodecId, LengthPrefixMode, Reader, ReaderOptions, Writer, WriterOptions};

#[derive(Parser)]
#[command(name = "zs-cli", version, about = "Query and build .zs record containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new .zs file from a sorted input file
    Make {
        /// Arbitrary JSON object stored as the file's metadata
        metadata: String,
        /// Input file, or "-" for stdin; records must already be sorted
        input_file: String,
        /// Path of the .zs file to create
        new_zs_file: PathBuf,

        #[arg(long, conflicts_with = "length_prefixed")]
        terminator: Option<String>,
        #[arg(long, value_parser = ["uleb128", "u64le"])]
        length_prefixed: Option<String>,
        #[arg(short = 'j', long, default_value = "guess")]
        parallelism: String,
        #[arg(long)]
        no_spinner: bool,
        #[arg(long, default_value_t = 1024)]
        branching_factor: usize,
        #[arg(long, default_value_t = 131072)]
        approx_block_size: usize,
        #[arg(long, default_value = "bz2")]
        codec: String,
        #[arg(short = 'z', long)]
        compress_level: Option<String>,
        #[arg(long)]
        no_default_metadata: bool,
    },
    /// Output some or all of the records in a .zs file
    Dump {
        /// Path or URL of the .zs file; a leading "http" is treated as a URL
        zs_file: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        stop: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(short = 'j', long, default_value = "guess")]
        parallelism: String,
        #[arg(short = 'o', long, default_value = "-")]
        output: String,
        #[arg(long, conflicts_with = "length_prefixed")]
        terminator: Option<String>,
        #[arg(long, value_parser = ["uleb128", "u64le"])]
        length_prefixed: Option<String>,
    },
    /// Display general information from a .zs file's header
    Info {
        zs_file: String,
        #[arg(short = 'm', long)]
        metadata_only: bool,
    },
    /// Check a .zs file for errors or data corruption
    Validate {
        zs_file: String,
        #[arg(short = 'j', long, default_value = "guess")]
        parallelism: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse().command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("zs: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Commands) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Make {
            metadata,
            input_file,
            new_zs_file,
            terminator,
            length_prefixed,
            parallelism,
            no_spinner: _,
            branching_factor,
            approx_block_size,
            codec,
            compress_level,
            no_default_metadata,
        } => cmd_make(
            &metadata,
            &input_file,
            &new_zs_file,
            terminator.as_deref(),
            length_prefixed.as_deref(),
            &parallelism,
            branching_factor,
            approx_block_size,
            &codec,
            compress_level.as_deref(),
            no_default_metadata,
        ),
        Commands::Dump {
            zs_file,
            start,
            stop,
            prefix,
            parallelism,
            output,
            terminator,
            length_prefixed,
        } => cmd_dump(
            &zs_file,
            start.as_deref(),
            stop.as_deref(),
            prefix.as_deref(),
            &parallelism,
            &output,
            terminator.as_deref(),
            length_prefixed.as_deref(),
        ),
        Commands::Info { zs_file, metadata_only } => cmd_info(&zs_file, metadata_only),
        Commands::Validate { zs_file, parallelism } => cmd_validate(&zs_file, &parallelism),
    }
}

fn parse_parallelism(s: &str) -> Result<Option<usize>, Box<dyn std::error::Error>> {
    if s == "guess" {
        Ok(None)
    } else {
        Ok(Some(s.parse::<usize>()?))
    }
}

fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0u8),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(((hi << 4) | lo) as u8);
                }
            }
            Some(other) => out.push(other as u8),
            None => out.push(b'\\'),
        }
    }
    out
}

fn open_reader(path_or_url: &str, parallelism: Option<usize>) -> zs::Result<Reader> {
    let options = ReaderOptions {
        parallelism,
        ..ReaderOptions::default()
    };
    if path_or_url.starts_with("http") {
        Reader::open_url(path_or_url, options)
    } else {
        Reader::open(path_or_url, options)
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_make(
    metadata_json: &str,
    input_file: &str,
    new_zs_file: &PathBuf,
    terminator: Option<&str>,
    length_prefixed: Option<&str>,
    parallelism: &str,
    branching_factor: usize,
    approx_block_size: usize,
    codec: &str,
    compress_level: Option<&str>,
    no_default_metadata: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let metadata: serde_json::Value = serde_json::from_str(metadata_json)
        .map_err(|e| format!("error parsing metadata as JSON: {e}"))?;
    if !metadata.is_object() {
        return Err("metadata must be a JSON object".into());
    }

    let codec_id = CodecId::from_shorthand(codec).ok_or_else(|| format!("unknown codec {codec:?}"))?;
    let (level, extreme) = match (codec, compress_level) {
        ("lzma", None) => (0, true),
        (_, None) => (default_level_for(codec_id), false),
        ("lzma", Some(cl)) => {
            let (num, extreme) = match cl.strip_suffix('e') {
                Some(rest) => (rest, true),
                None => (cl, false),
            };
            (num.parse::<u32>()?, extreme)
        }
        (_, Some(cl)) => (cl.parse::<u32>()?, false),
    };

    let options = WriterOptions {
        branching_factor,
        parallelism: parse_parallelism(parallelism)?,
        codec: codec_id,
        codec_level: level,
        codec_extreme: extreme,
        approx_block_size,
        include_default_metadata: !no_default_metadata,
    };

    println!("zs: Opening new ZS file: {}", new_zs_file.display());
    let mut writer = Writer::create(new_zs_file, metadata, options)?;

    println!("zs: Reading input file: {input_file}");
    io::stdout().flush().ok();
    let mut handle: Box<dyn Read> = if input_file == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(input_file)?)
    };

    match length_prefixed {
        Some("uleb128") => {
            writer.add_file_contents_length_prefixed(&mut handle, approx_block_size, LengthPrefixMode::Uleb128)?
        }
        Some("u64le") => {
            writer.add_file_contents_length_prefixed(&mut handle, approx_block_size, LengthPrefixMode::U64Le)?
        }
        Some(other) => return Err(format!("invalid --length-prefixed value {other:?}").into()),
        None => {
            let term = unescape(terminator.unwrap_or("\\n"));
            if term.len() != 1 {
                return Err("--terminator must be a single byte".into());
            }
            writer.add_file_contents_terminated(&mut handle, approx_block_size, term[0])?;
        }
    }

    writer.finish()?;
    println!("zs: Done.");
    Ok(ExitCode::SUCCESS)
}

fn default_level_for(codec: CodecId) -> u32 {
    match codec {
        CodecId::Deflate => 6,
        CodecId::Bz2 => 9,
        CodecId::Lzma2 => 0,
        CodecId::None => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_dump(
    zs_file: &str,
    start: Option<&str>,
    stop: Option<&str>,
    prefix: Option<&str>,
    parallelism: &str,
    output: &str,
    terminator: Option<&str>,
    length_prefixed: Option<&str>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let reader = open_reader(zs_file, parse_parallelism(parallelism)?)?;

    let start = start.map(unescape);
    let stop = stop.map(unescape);
    let prefix = prefix.map(unescape);
    let term = terminator.map(unescape);
    let mode = match length_prefixed {
        Some("uleb128") => Some(LengthPrefixMode::Uleb128),
        Some("u64le") => Some(LengthPrefixMode::U64Le),
        Some(other) => return Err(format!("invalid --length-prefixed value {other:?}").into()),
        None => None,
    };

    let mut out: Box<dyn Write> = if output == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(output)?)
    };

    reader.dump(
        &mut out,
        start.as_deref(),
        stop.as_deref(),
        prefix.as_deref(),
        term.as_deref(),
        mode,
    )?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_info(zs_file: &str, metadata_only: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let reader = open_reader(zs_file, Some(0))?;
    let info = if metadata_only {
        reader.metadata().clone()
    } else {
        json!({
            "root_index_offset": reader.root_index_offset(),
            "root_index_length": reader.root_index_length(),
            "total_file_length": reader.total_file_length(),
            "codec": reader.codec().canonical_name(),
            "data_sha256": hex::encode(reader.data_sha256()),
            "metadata": reader.metadata(),
            "root_index_level": reader.root_index_level()?,
        })
    };
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(zs_file: &str, parallelism: &str) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let reader = open_reader(zs_file, parse_parallelism(parallelism)?)?;
    match reader.validate() {
        Ok(()) => {
            println!("looks good!");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.kind() == zs::ErrorKind::Corrupt => {
            println!("{e}");
            Ok(ExitCode::from(1))
        }
        Err(e) => Err(e.into()),
    }
}
