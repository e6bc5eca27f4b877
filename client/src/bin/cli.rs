use std::path::PathBuf;

use attested_client::cache::{DocumentFetcher, HttpDocumentFetcher};
use attested_client::config::Config;
use attested_client::nitro::{NitroVerifier, parse_document};
use attested_client::transport::dial_address;
use attested_client::{EnclaveClient, Error, MeasurementRegisterSet, init_logging};
use clap::{Parser, Subcommand};
use eyre::{WrapErr, eyre};

#[derive(Parser)]
#[command(version, about, long_about=None)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the config file (defaults to ~/.attested/config.toml)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch the enclave's attestation document and print its registers")]
    FetchDoc,
    #[command(about = "Connect to the enclave and report whether it passes attestation")]
    Attest,
    #[command(about = "Perform a GET request over an attested connection")]
    Get {
        #[arg(short, long, value_name = "PATH", help = "Path of the request, e.g. /health")]
        path: String,
    },
}

fn nitro_verifier(config: &Config) -> eyre::Result<NitroVerifier> {
    let path = config
        .trusted_root
        .as_ref()
        .ok_or_else(|| eyre!("trusted_root is not set in the config"))?;
    let pem = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Could not read {}", path.display()))?;
    Ok(NitroVerifier::from_pem(&pem)?)
}

async fn client(config: &Config) -> eyre::Result<EnclaveClient<NitroVerifier>> {
    let verifier = nitro_verifier(config)?;
    Ok(EnclaveClient::with_static_policy(config, verifier, config.policy.iter().cloned()).await?)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    match &cli.command {
        Commands::FetchDoc => {
            let fetcher = HttpDocumentFetcher::new(&config.enclave_host)?;
            tracing::info!("Fetching {}...", fetcher.url());
            let doc = fetcher.fetch().await?;
            let parsed = parse_document(&doc)?;
            let registers = MeasurementRegisterSet::from(&parsed.registers());
            tracing::info!("Fetched a {} byte document from {}", doc.len(), parsed.module_id);
            println!("{registers}");
        }
        Commands::Attest => {
            let client = client(&config).await?;
            let uri: http::Uri = format!("https://{}", config.enclave_host).parse()?;
            let address = dial_address(&uri)?;
            let result = client.dialer().dial("tcp", &address).await;
            client.shutdown().await;
            match result {
                Ok(_) => println!("{address}: trusted"),
                Err(Error::AttestationFailed(failure)) => {
                    println!("{address}: rejected ({failure})")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Get { path } => {
            let client = client(&config).await?;
            let result = client.get(path).await;
            client.shutdown().await;
            let response = result?;
            tracing::info!("Enclave responded with {}", response.status());
            println!("{}", String::from_utf8_lossy(response.body()));
        }
    }
    Ok(())
}
