use anyhow::{Context, Result};
use apkpatch::{align, Apksigner, CancelFlag, ExportConfig, ExportJob, SigningConfig};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
    tracing_log::LogTracer::init().ok();
    let env = std::env::var("XPORT_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
    let args = Args::parse();
    args.command.run()
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a template into a patched, aligned, optionally signed package
    Export {
        /// Template archive to rewrite
        template: PathBuf,
        /// Export configuration file
        #[clap(long)]
        config: PathBuf,
        /// Destination package path (must end in .apk)
        #[clap(long, short)]
        out: PathBuf,
        /// Keystore for signing; omit to produce an unsigned package
        #[clap(long)]
        keystore: Option<PathBuf>,
        #[clap(long)]
        key_alias: Option<String>,
        #[clap(long)]
        key_pass: Option<String>,
        /// Explicit apksigner location, discovered from the SDK otherwise
        #[clap(long)]
        apksigner: Option<PathBuf>,
    },
    /// Run the same patchers into a directory build instead of an archive
    ExportDir {
        /// Template archive to rewrite
        template: PathBuf,
        /// Export configuration file
        #[clap(long)]
        config: PathBuf,
        /// Destination directory
        #[clap(long, short)]
        out: PathBuf,
    },
    /// Realign the stored entries of an existing archive
    Align {
        input: PathBuf,
        output: PathBuf,
    },
    /// Report stored entries that are not 4-byte aligned
    CheckAlign {
        input: PathBuf,
    },
    /// Sign a finished archive
    Sign {
        apk: PathBuf,
        #[clap(long)]
        keystore: PathBuf,
        #[clap(long)]
        key_alias: String,
        #[clap(long)]
        key_pass: String,
        #[clap(long)]
        apksigner: Option<PathBuf>,
    },
    /// Verify the signature of an archive
    Verify {
        apk: PathBuf,
        #[clap(long)]
        apksigner: Option<PathBuf>,
    },
}

fn load_config(path: &PathBuf) -> Result<ExportConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid configuration in {}", path.display()))
}

impl Commands {
    fn run(self) -> Result<()> {
        match self {
            Self::Export {
                template,
                config,
                out,
                keystore,
                key_alias,
                key_pass,
                apksigner,
            } => {
                let config = load_config(&config)?;
                let signing = match keystore {
                    Some(keystore) => Some(SigningConfig {
                        keystore,
                        key_alias: key_alias
                            .context("--key-alias is required when a keystore is given")?,
                        password: key_pass
                            .context("--key-pass is required when a keystore is given")?,
                    }),
                    None => None,
                };
                let job = ExportJob {
                    template: &template,
                    output: &out,
                    config: &config,
                    signing: signing.as_ref(),
                    apksigner: apksigner.as_deref(),
                };
                let report = job.run(&CancelFlag::new())?;
                println!(
                    "exported {} ({})",
                    report.output.display(),
                    if report.signed { "signed" } else { "unsigned" }
                );
            }
            Self::ExportDir {
                template,
                config,
                out,
            } => {
                let config = load_config(&config)?;
                apkpatch::export_to_directory(&template, &out, &config, &CancelFlag::new())?;
                println!("exported {}", out.display());
            }
            Self::Align { input, output } => {
                let src = BufReader::new(
                    File::open(&input)
                        .with_context(|| format!("failed to open {}", input.display()))?,
                );
                let dst = BufWriter::new(
                    File::create(&output)
                        .with_context(|| format!("failed to create {}", output.display()))?,
                );
                let mut file = align::align_archive(src, dst, align::ALIGNMENT)?;
                file.flush()?;
                println!("aligned {}", output.display());
            }
            Self::CheckAlign { input } => {
                let src = BufReader::new(
                    File::open(&input)
                        .with_context(|| format!("failed to open {}", input.display()))?,
                );
                let bad = align::check_alignment(src, align::ALIGNMENT as u64)?;
                for entry in &bad {
                    println!("{:8} {} (BAD)", entry.offset, entry.name);
                }
                if !bad.is_empty() {
                    anyhow::bail!("{} entries are misaligned", bad.len());
                }
                println!("all stored entries are aligned");
            }
            Self::Sign {
                apk,
                keystore,
                key_alias,
                key_pass,
                apksigner,
            } => {
                let signing = SigningConfig {
                    keystore,
                    key_alias,
                    password: key_pass,
                };
                let tool = Apksigner::locate(apksigner.as_deref())?;
                tool.sign(&apk, &signing)?;
                tool.verify(&apk)?;
                println!("signed {}", apk.display());
            }
            Self::Verify { apk, apksigner } => {
                let tool = Apksigner::locate(apksigner.as_deref())?;
                tool.verify(&apk)?;
                println!("verified {}", apk.display());
            }
        }
        Ok(())
    }
}
