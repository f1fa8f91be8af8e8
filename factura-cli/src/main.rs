use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use factura_core::api::{AuthorityResponse, HaciendaClient, Submission, SubmissionClient};
use factura_core::certificate::{self, CertificateInfo, CertificateSource};
use factura_core::clock::{costa_rica_time, SystemClock};
use factura_core::config::{Config, Credentials, EnvironmentType, RateLimitConfig, Settings};
use factura_core::document::{Clave, ConsecutiveNumber, DocumentType, SituationCode};
use factura_core::rate_limit::{FileBucketStore, RateLimiter};
use factura_core::sign::{self, DocumentSigner};
use factura_core::xml::Document;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "factura", version)]
#[command(about = "Sign and submit Costa Rica electronic documents")]
struct Cli {
    /// JSON settings file; flags and environment variables override it.
    #[arg(long, global = true, env = "FACTURA_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CertArgs {
    /// PKCS#12 archive (.p12 / .pfx)
    #[arg(long, conflicts_with_all = ["cert", "key"])]
    p12: Option<PathBuf>,
    /// PEM or DER certificate, used with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PKCS#8 or PKCS#1 private key, used with --cert
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    #[arg(long, env = "FACTURA_CERT_PASSWORD", hide_env_values = true)]
    cert_password: Option<String>,
}

#[derive(Args)]
struct HaciendaArgs {
    #[arg(long, env = "FACTURA_ENV")]
    env: Option<EnvironmentType>,
    #[arg(long, env = "FACTURA_HACIENDA_USER")]
    user: Option<String>,
    #[arg(long, env = "FACTURA_HACIENDA_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long, env = "FACTURA_HACIENDA_BASE_URL")]
    base_url: Option<String>,
    /// Share the rate limit bucket stored in this directory
    #[arg(long)]
    bucket_dir: Option<PathBuf>,
}

#[derive(Args)]
struct BucketArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the signing certificate summary as JSON
    CertInfo {
        #[command(flatten)]
        cert: CertArgs,
    },
    /// Print the signing certificate as PEM
    CertExport {
        #[command(flatten)]
        cert: CertArgs,
    },
    /// Build a 50-digit clave
    Clave {
        #[arg(long)]
        issuer: String,
        /// Document type code: 01 invoice, 02 debit note, 03 credit note, 04 ticket
        #[arg(long, default_value = "04")]
        doc_type: String,
        #[arg(long)]
        sequence: u64,
        #[arg(long, default_value_t = 1)]
        branch: u16,
        #[arg(long, default_value_t = 1)]
        terminal: u32,
        /// Issue date (YYYY-MM-DD); defaults to today in Costa Rica
        #[arg(long)]
        date: Option<NaiveDate>,
        /// 1 normal, 2 contingency, 3 no internet
        #[arg(long, default_value = "1")]
        situation: char,
        #[arg(long)]
        security_code: Option<u32>,
    },
    /// Print the canonical SHA-256 digest of an XML file
    Digest {
        file: PathBuf,
        /// Use inclusive instead of exclusive canonicalization
        #[arg(long)]
        inclusive: bool,
    },
    /// Add a XAdES-EPES signature to an XML file
    Sign {
        file: PathBuf,
        #[command(flatten)]
        cert: CertArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Verify the signature of a signed XML file
    Verify { file: PathBuf },
    /// Submit a signed document to Hacienda
    Submit {
        file: PathBuf,
        /// Defaults to the document's Clave element
        #[arg(long)]
        clave: Option<String>,
        /// Defaults to the document's Emisor identification
        #[arg(long)]
        issuer: Option<String>,
        #[arg(long)]
        receiver: Option<String>,
        #[command(flatten)]
        hacienda: HaciendaArgs,
    },
    /// Query the status of a submitted document
    Status {
        clave: String,
        #[command(flatten)]
        hacienda: HaciendaArgs,
    },
    /// Check connectivity to the reception API
    Ping {
        #[command(flatten)]
        hacienda: HaciendaArgs,
    },
    /// Show the state of a file-backed rate limit bucket
    BucketInspect {
        #[command(flatten)]
        bucket: BucketArgs,
    },
    /// Refill a file-backed rate limit bucket
    BucketReset {
        #[command(flatten)]
        bucket: BucketArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = match &cli.config {
        Some(path) => Some(
            Settings::from_json_file(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
        ),
        None => None,
    };

    match cli.command {
        Commands::CertInfo { cert } => {
            let bundle = load_bundle(&cert)?;
            let info = CertificateInfo::new(bundle.certificate(), Utc::now());
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::CertExport { cert } => {
            let bundle = load_bundle(&cert)?;
            print!("{}", certificate::export_pem(bundle.certificate())?);
        }
        Commands::Clave {
            issuer,
            doc_type,
            sequence,
            branch,
            terminal,
            date,
            situation,
            security_code,
        } => {
            let document_type = DocumentType::from_code(&doc_type)?;
            let consecutive = ConsecutiveNumber::new(branch, terminal, document_type, sequence)?;
            let situation = SituationCode::from_digit(situation)?;
            let date = date.unwrap_or_else(|| costa_rica_time(Utc::now()).date_naive());
            let clave = match security_code {
                Some(code) => Clave::generate(date, &issuer, &consecutive, situation, code)?,
                None => Clave::generate_random(date, &issuer, &consecutive, situation)?,
            };
            println!("{clave}");
        }
        Commands::Digest { file, inclusive } => {
            let xml = read_text(&file)?;
            println!("{}", sign::document_digest(&xml, !inclusive)?);
        }
        Commands::Sign { file, cert, output } => {
            let xml = read_text(&file)?;
            let signer = DocumentSigner::new(Arc::new(load_bundle(&cert)?));
            certificate::ensure_valid(signer.certificate(), Utc::now())
                .context("signing certificate is not usable")?;
            let signed = signer
                .sign_xml(&xml, Utc::now())
                .with_context(|| format!("signing {}", file.display()))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, signed.xml())
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(output = %path.display(), signature = %signed.signature_id(), "document signed");
                }
                None => println!("{}", signed.xml()),
            }
        }
        Commands::Verify { file } => {
            let xml = read_text(&file)?;
            let certificate = sign::verify(&xml)
                .with_context(|| format!("verifying {}", file.display()))?;
            let info = CertificateInfo::new(&certificate, Utc::now());
            println!(
                "{}",
                serde_json::json!({
                    "valid": true,
                    "subject": certificate.subject(),
                    "serial_number": info.serial_number,
                    "not_after": info.not_after,
                })
            );
        }
        Commands::Submit {
            file,
            clave,
            issuer,
            receiver,
            hacienda,
        } => {
            let signed_xml = read_text(&file)?;
            let submission = submission_for(signed_xml, clave, issuer, receiver)?;
            let client = HaciendaClient::new(client_config(settings.as_ref(), &hacienda)?)?;
            acquire_token(settings.as_ref(), &hacienda).await?;
            let response = client
                .submit(&submission)
                .await
                .with_context(|| format!("submitting {}", submission.clave))?;
            print_response(&response);
        }
        Commands::Status { clave, hacienda } => {
            let client = HaciendaClient::new(client_config(settings.as_ref(), &hacienda)?)?;
            acquire_token(settings.as_ref(), &hacienda).await?;
            let response = client
                .check_status(&clave)
                .await
                .with_context(|| format!("checking status of {clave}"))?;
            print_response(&response);
        }
        Commands::Ping { hacienda } => {
            let config = client_config(settings.as_ref(), &hacienda)?;
            let url = config.base_url().to_string();
            if !HaciendaClient::new(config)?.test_connection().await {
                bail!("Hacienda API is not accessible at {url}");
            }
            println!("ok {url}");
        }
        Commands::BucketInspect { bucket } => {
            let limiter = bucket_limiter(settings.as_ref(), &bucket)?;
            let snapshot = limiter.inspect().await.context("reading rate limit bucket")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::BucketReset { bucket } => {
            let limiter = bucket_limiter(settings.as_ref(), &bucket)?;
            limiter.reset().await.context("resetting rate limit bucket")?;
            println!("reset {}", limiter.config().bucket_key);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_bundle(args: &CertArgs) -> Result<certificate::CertificateBundle> {
    let source = match (&args.p12, &args.cert, &args.key) {
        (Some(p12), _, _) => CertificateSource::pkcs12_file(p12)?,
        (None, Some(cert), Some(key)) => CertificateSource::pem_files(cert, key)?,
        _ => bail!("either --p12 or both --cert and --key are required"),
    };
    certificate::load(&source, args.cert_password.as_deref())
        .context("loading signing certificate")
}

fn client_config(settings: Option<&Settings>, args: &HaciendaArgs) -> Result<Config> {
    let env = args
        .env
        .or(settings.map(|s| s.environment))
        .unwrap_or(EnvironmentType::Sandbox);
    let username = args
        .user
        .clone()
        .or_else(|| settings.map(|s| s.credentials.username().to_string()))
        .ok_or_else(|| anyhow!("Hacienda user is required (--user or FACTURA_HACIENDA_USER)"))?;
    let password = args
        .password
        .clone()
        .or_else(|| settings.map(|s| s.credentials.password().to_string()))
        .ok_or_else(|| {
            anyhow!("Hacienda password is required (--password or FACTURA_HACIENDA_PASSWORD)")
        })?;

    let mut config = Config::new(env, Credentials::new(username, password));
    if let Some(settings) = settings {
        config = config.with_request_timeout(Duration::from_secs(settings.request_timeout_secs));
    }
    let base_url = args
        .base_url
        .clone()
        .or_else(|| settings.and_then(|s| s.base_url.clone()));
    if let Some(base_url) = base_url {
        config = config.with_base_url(base_url);
    }
    debug!(env = env.as_str(), base_url = %config.base_url(), "client configured");
    Ok(config)
}

fn rate_limit_config(settings: Option<&Settings>, key: Option<&str>) -> RateLimitConfig {
    let mut config = settings
        .map(|s| s.rate_limit.clone())
        .unwrap_or_default();
    if let Some(key) = key {
        config.bucket_key = key.to_string();
    }
    config
}

fn bucket_limiter(settings: Option<&Settings>, args: &BucketArgs) -> Result<RateLimiter> {
    Ok(RateLimiter::new(
        Arc::new(FileBucketStore::new(&args.dir)),
        rate_limit_config(settings, args.key.as_deref()),
        Arc::new(SystemClock),
    )?)
}

async fn acquire_token(settings: Option<&Settings>, args: &HaciendaArgs) -> Result<()> {
    let Some(dir) = &args.bucket_dir else {
        return Ok(());
    };
    let limiter = RateLimiter::new(
        Arc::new(FileBucketStore::new(dir)),
        rate_limit_config(settings, None),
        Arc::new(SystemClock),
    )?;
    limiter
        .acquire(Duration::from_secs(10))
        .await
        .context("waiting for a rate limit token")
}

fn submission_for(
    signed_xml: String,
    clave: Option<String>,
    issuer: Option<String>,
    receiver: Option<String>,
) -> Result<Submission> {
    let document = Document::parse(&signed_xml).context("parsing signed document")?;
    let root = &document.root;
    let party_number = |party: &str| {
        root.child(party)
            .and_then(|p| p.child("Identificacion"))
            .and_then(|id| id.child("Numero"))
            .map(|n| n.text().trim().to_string())
    };
    let clave = match clave {
        Some(clave) => clave,
        None => root
            .child("Clave")
            .map(|c| c.text().trim().to_string())
            .ok_or_else(|| anyhow!("document has no Clave element; pass --clave"))?,
    };
    Clave::parse(&clave).with_context(|| format!("invalid clave '{clave}'"))?;
    let issuer_id = issuer
        .or_else(|| party_number("Emisor"))
        .ok_or_else(|| anyhow!("document has no Emisor identification; pass --issuer"))?;
    Ok(Submission {
        clave,
        receiver_id: receiver.or_else(|| party_number("Receptor")),
        signed_xml,
        issuer_id,
    })
}

fn print_response(response: &AuthorityResponse) {
    println!(
        "{}",
        serde_json::json!({
            "clave": response.clave(),
            "status": response.status().as_str(),
            "http_status": response.http_status(),
            "date": response.date(),
            "message_code": response.message_code(),
            "message_detail": response.message_detail(),
        })
    );
}
