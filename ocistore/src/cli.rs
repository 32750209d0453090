use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::config::{AppConfig, StorageBackend, TransferSettings};
use crate::layout;
use crate::operations::{self, ImageSource, PullRequest, PushRequest};
use crate::reference::ImageReference;
use crate::validate::{validate, RawBackendConfig};

/// Multi-Backend Docker Image Storage
#[derive(Debug, Parser)]
#[command(
    name = "oci-store",
    author,
    version,
    about,
    long_about = "A CLI tool to store Docker/OCI images in cloud storage.\n\n\
                  Images are kept content-addressed in an S3 bucket, a Google Cloud Storage \
                  bucket or an Azure Blob Storage container and exchanged with local OCI \
                  image layout directories."
)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "OCI_STORE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// S3 storage operations
    S3 {
        #[command(flatten)]
        options: S3Options,

        #[command(subcommand)]
        action: Action,
    },

    /// Google Cloud Storage operations
    Gcs {
        #[command(flatten)]
        options: GcsOptions,

        #[command(subcommand)]
        action: Action,
    },

    /// Azure Blob Storage operations
    Azure {
        #[command(flatten)]
        options: AzureOptions,

        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Debug, Args)]
pub struct S3Options {
    /// AWS region of the bucket
    #[arg(short, long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Endpoint of an S3-compatible service
    #[arg(short, long, global = true)]
    pub endpoint: Option<String>,

    /// Access key ID (defaults to the AWS credential chain)
    #[arg(long, global = true, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Secret access key
    #[arg(long, global = true, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Path prefix inside the bucket
    #[arg(long, global = true)]
    pub root_dir: Option<String>,
}

#[derive(Debug, Args)]
pub struct GcsOptions {
    /// Google Cloud project ID
    #[arg(short, long, global = true, env = "GOOGLE_CLOUD_PROJECT")]
    pub project: Option<String>,

    /// Service account key file (defaults to application default credentials)
    #[arg(long, global = true, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub keyfile: Option<String>,

    /// Custom endpoint
    #[arg(short, long, global = true)]
    pub endpoint: Option<String>,

    /// Path prefix inside the bucket
    #[arg(long, global = true)]
    pub root_dir: Option<String>,
}

#[derive(Debug, Args)]
pub struct AzureOptions {
    /// Storage account name
    #[arg(short, long, global = true, env = "AZURE_STORAGE_ACCOUNT")]
    pub account_name: Option<String>,

    /// Storage account key
    #[arg(short = 'k', long, global = true, env = "AZURE_STORAGE_KEY", hide_env_values = true)]
    pub account_key: Option<String>,

    /// Custom blob endpoint (defaults to https://<account>.blob.core.windows.net)
    #[arg(short, long, global = true)]
    pub endpoint: Option<String>,

    /// Path prefix inside the container
    #[arg(long, global = true)]
    pub root_dir: Option<String>,

    /// Credentials used without an account key: client_secret (default) or default_credentials
    #[arg(long, global = true)]
    pub credential_type: Option<String>,

    /// Application (client) ID of the service principal
    #[arg(long, global = true, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Directory (tenant) ID of the service principal
    #[arg(long, global = true, env = "AZURE_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Client secret of the service principal
    #[arg(long, global = true, env = "AZURE_SECRET", hide_env_values = true)]
    pub secret: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Push an image from a local OCI image layout
    Push {
        /// Target reference, e.g. my-bucket/team/app:v1 or my-bucket/team/app@sha256:...
        reference: String,

        /// OCI image layout directory (defaults to a directory named after the repository)
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Tag of the image in the layout's index (defaults to the reference's tag)
        #[arg(long)]
        source_tag: Option<String>,
    },

    /// Pull an image into a new OCI image layout directory
    Pull {
        /// Source reference, e.g. my-bucket/team/app:v1
        reference: String,

        /// Output directory (defaults to a directory named after the repository); must not exist or be empty
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the tags of a repository
    Tags {
        /// Repository, e.g. my-bucket/team/app
        repository: String,
    },

    /// Delete a manifest by tag or digest; blobs are kept
    Delete {
        /// Reference to delete
        reference: String,
    },
}

impl From<S3Options> for RawBackendConfig {
    fn from(options: S3Options) -> Self {
        RawBackendConfig {
            region: options.region,
            endpoint: options.endpoint,
            access_key: options.access_key,
            secret_key: options.secret_key,
            root_dir: options.root_dir,
            ..Default::default()
        }
    }
}

impl From<GcsOptions> for RawBackendConfig {
    fn from(options: GcsOptions) -> Self {
        RawBackendConfig {
            project_id: options.project,
            keyfile: options.keyfile,
            endpoint: options.endpoint,
            root_dir: options.root_dir,
            ..Default::default()
        }
    }
}

impl From<AzureOptions> for RawBackendConfig {
    fn from(options: AzureOptions) -> Self {
        RawBackendConfig {
            account_name: options.account_name,
            account_key: options.account_key,
            credential_type: options.credential_type,
            client_id: options.client_id,
            tenant_id: options.tenant_id,
            client_secret: options.secret,
            endpoint: options.endpoint,
            root_dir: options.root_dir,
            ..Default::default()
        }
    }
}

/// Dispatch a parsed command line.
///
/// A missing required backend field is reported before any other
/// configuration problem.
pub async fn run(cli: Cli) -> Result<()> {
    let (backend, options, action): (StorageBackend, RawBackendConfig, Action) = match cli.command {
        Commands::S3 { options, action } => (StorageBackend::S3, options.into(), action),
        Commands::Gcs { options, action } => (StorageBackend::Gcs, options.into(), action),
        Commands::Azure { options, action } => (StorageBackend::Azure, options.into(), action),
    };

    let app_config = match AppConfig::load(cli.config.as_deref()) {
        Ok(app_config) => app_config,
        Err(err) => {
            // Flags and provider env vars may still be incomplete on their own
            validate(backend, &options)?;
            return Err(err).context("Failed to load configuration");
        }
    };

    // Flags and provider env vars win over the configuration file
    let raw = RawBackendConfig::or(options, app_config.backend(backend));
    debug!("Using {} configuration: {:?}", backend.domain(), raw);
    validate(backend, &raw)?;

    let settings = &app_config.transfer;
    settings.validate().context("Invalid transfer settings")?;
    match action {
        Action::Push {
            reference,
            image,
            source_tag,
        } => cmd_push(backend, raw, reference, image, source_tag, settings).await,
        Action::Pull { reference, output } => cmd_pull(backend, raw, reference, output, settings).await,
        Action::Tags { repository } => cmd_tags(backend, raw, &repository, settings).await,
        Action::Delete { reference } => cmd_delete(backend, raw, &reference, settings).await,
    }
}

async fn cmd_push(
    backend: StorageBackend,
    config: RawBackendConfig,
    reference: String,
    image: Option<PathBuf>,
    source_tag: Option<String>,
    settings: &TransferSettings,
) -> Result<()> {
    let request = PushRequest {
        backend,
        config,
        reference,
        source: ImageSource::Layout {
            path: image,
            tag: source_tag,
        },
    };
    let report = operations::push_image(request, settings).await?;

    eprintln!(
        "Pushed {} ({} blob(s) uploaded, {} already present)",
        report.reference,
        report.uploaded.len(),
        report.skipped.len()
    );
    println!("{}", report.manifest_digest);
    Ok(())
}

async fn cmd_pull(
    backend: StorageBackend,
    config: RawBackendConfig,
    reference: String,
    output: Option<PathBuf>,
    settings: &TransferSettings,
) -> Result<()> {
    let request = PullRequest {
        backend,
        config,
        reference: reference.clone(),
    };
    let image = operations::pull_image(request, settings).await?;

    // Already parsed once by the pull itself
    let parsed = ImageReference::parse(backend, &reference)?;
    let output = output.unwrap_or_else(|| PathBuf::from(&parsed.repository));
    layout::write_image(&output, &image, parsed.tag())
        .await
        .with_context(|| format!("Failed to write image to {}", output.display()))?;

    eprintln!("Pulled {} into {}", reference, output.display());
    println!("{}", image.manifest_digest);
    Ok(())
}

async fn cmd_tags(
    backend: StorageBackend,
    config: RawBackendConfig,
    repository: &str,
    settings: &TransferSettings,
) -> Result<()> {
    let tags = operations::list_tags(backend, &config, repository, settings).await?;
    for tag in tags {
        println!("{}", tag);
    }
    Ok(())
}

async fn cmd_delete(
    backend: StorageBackend,
    config: RawBackendConfig,
    reference: &str,
    settings: &TransferSettings,
) -> Result<()> {
    operations::delete_image(backend, &config, reference, settings).await?;
    eprintln!("Deleted {}", reference);
    Ok(())
}
