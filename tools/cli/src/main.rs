//! KeyLedger CLI - operator interface for the key lifecycle and transaction ledger.
//!
//! Rotation is meant to be driven by an external scheduler calling
//! `keyledger rotate --if-needed`; `expire` and `reap` cover the periodic sweeps.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use keyledger_common::{KeyId, Operation, RequestContext, UserId};
use keyledger_crypto::{Envelope, MasterKey};
use keyledger_gateway::{E2eeService, EngineConfig, MasterKeySource, MasterSecret, StoreConfig};

const CONFIG_FILENAME: &str = "config.json";
const DB_FILENAME: &str = "keyledger.db";

#[derive(Parser)]
#[command(name = "keyledger")]
#[command(about = "KeyLedger - E2EE key lifecycle and transaction ledger")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file and bootstrap the first active key.
    Init {
        /// Derive the master key from a passphrase instead of a raw key.
        #[arg(long)]
        passphrase: bool,

        /// SQLite database path (default: platform data dir).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Generate a new active key (the current one starts rotating).
    Generate,

    /// Rotate the active key.
    Rotate {
        /// Only rotate when the active key is within the rotation threshold.
        #[arg(long)]
        if_needed: bool,
    },

    /// Revoke a key immediately.
    Revoke {
        /// Key id.
        key_id: String,
    },

    /// Show one key.
    Status {
        /// Key id.
        key_id: String,
    },

    /// List all keys.
    Keys {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Expire rotating keys past their grace period, or one key now.
    Expire {
        /// Expire this rotating key regardless of grace.
        key_id: Option<String>,
    },

    /// Fail pending transactions past the timeout.
    Reap,

    /// Encrypt a file (or stdin) into an envelope.
    Encrypt {
        /// User the transaction is recorded for.
        #[arg(short, long)]
        user: String,

        /// Input file (default: stdin).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypt an envelope file (or stdin).
    Decrypt {
        /// User the transaction is recorded for.
        #[arg(short, long)]
        user: String,

        /// Input file (default: stdin).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show transaction and audit statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    if let Commands::Init {
        passphrase,
        db,
        force,
    } = &cli.command
    {
        return cmd_init(&config_path, *passphrase, db.clone(), *force).await;
    }

    let service = open_service(&config_path).await?;

    let result = match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Generate => cmd_generate(&service).await,
        Commands::Rotate { if_needed } => cmd_rotate(&service, if_needed).await,
        Commands::Revoke { key_id } => cmd_revoke(&service, &key_id).await,
        Commands::Status { key_id } => cmd_status(&service, &key_id).await,
        Commands::Keys { json } => cmd_keys(&service, json).await,
        Commands::Expire { key_id } => cmd_expire(&service, key_id.as_deref()).await,
        Commands::Reap => cmd_reap(&service).await,
        Commands::Encrypt {
            user,
            input,
            output,
        } => cmd_encrypt(&service, &user, input.as_deref(), output.as_deref()).await,
        Commands::Decrypt {
            user,
            input,
            output,
        } => cmd_decrypt(&service, &user, input.as_deref(), output.as_deref()).await,
        Commands::Stats => cmd_stats(&service).await,
    };

    // Drain queued audit events before exiting.
    service
        .recorder()
        .flush()
        .await
        .context("Failed to flush audit events")?;
    result
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No platform config directory")?;
    Ok(dir.join("keyledger").join(CONFIG_FILENAME))
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("No platform data directory")?;
    Ok(dir.join("keyledger").join(DB_FILENAME))
}

/// Prompt for a passphrase securely.
fn prompt_passphrase(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passphrase")
}

/// Resolve the master secret from the environment, prompting for a passphrase if needed.
fn master_secret(source: &MasterKeySource) -> Result<MasterSecret> {
    if let Some(secret) = source.from_env()? {
        return Ok(secret);
    }
    match source {
        MasterKeySource::Passphrase { .. } => {
            let passphrase = prompt_passphrase("Master passphrase: ")?;
            Ok(source.resolve(passphrase)?)
        }
        MasterKeySource::Env { var } => {
            anyhow::bail!("{} is not set; export the base64 master key", var)
        }
    }
}

async fn open_service(config_path: &Path) -> Result<E2eeService> {
    let config = EngineConfig::load(config_path).with_context(|| {
        format!(
            "Failed to load {} (run `keyledger init` first)",
            config_path.display()
        )
    })?;
    let secret = master_secret(&config.master_key)?;
    E2eeService::open(&config, secret)
        .await
        .context("Failed to open engine")
}

/// Write a configuration and bootstrap the first key.
async fn cmd_init(
    config_path: &Path,
    passphrase: bool,
    db: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = EngineConfig::default();
    config.store = StoreConfig::Sqlite {
        path: match db {
            Some(path) => path,
            None => default_db_path()?,
        },
    };

    let secret = if passphrase {
        config.master_key = MasterKeySource::Passphrase {
            var: "KEYLEDGER_MASTER_PASSPHRASE".to_string(),
            kdf: Default::default(),
        };
        match config.master_key.from_env()? {
            Some(secret) => secret,
            None => {
                let first = prompt_passphrase("New master passphrase: ")?;
                let confirm = prompt_passphrase("Confirm passphrase: ")?;
                if first != confirm {
                    anyhow::bail!("Passphrases do not match");
                }
                config.master_key.resolve(first)?
            }
        }
    } else {
        match config.master_key.from_env()? {
            Some(secret) => secret,
            None => {
                let master = MasterKey::generate();
                println!("Generated master key. Store it securely and export it before use:");
                println!(
                    "  export {}={}",
                    config.master_key.var(),
                    master.to_base64()
                );
                MasterSecret::Key(master)
            }
        }
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(config_path, config.to_json()?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    info!("Wrote configuration to {}", config_path.display());

    let service = E2eeService::open(&config, secret)
        .await
        .context("Failed to open engine")?;
    let key_id = service
        .ensure_active_key()
        .await
        .context("Failed to bootstrap active key")?;
    service.recorder().flush().await?;

    println!("KeyLedger initialized.");
    println!("  Config: {}", config_path.display());
    println!("  Active key: {}", key_id);
    Ok(())
}

async fn cmd_generate(service: &E2eeService) -> Result<()> {
    let key_id = service
        .generate_key()
        .await
        .context("Failed to generate key")?;
    println!("Active key: {}", key_id);
    Ok(())
}

async fn cmd_rotate(service: &E2eeService, if_needed: bool) -> Result<()> {
    if if_needed {
        match service
            .rotate_if_needed()
            .await
            .context("Failed to check rotation")?
        {
            Some(key_id) => println!("Rotated. Active key: {}", key_id),
            None => println!("Active key is not due for rotation."),
        }
        return Ok(());
    }

    let key_id = service.rotate().await.context("Failed to rotate")?;
    println!("Rotated. Active key: {}", key_id);
    Ok(())
}

async fn cmd_revoke(service: &E2eeService, key_id: &str) -> Result<()> {
    let key_id = KeyId::new(key_id).context("Invalid key id")?;
    service
        .revoke(&key_id)
        .await
        .with_context(|| format!("Failed to revoke {}", key_id))?;
    println!("Revoked {}", key_id);
    Ok(())
}

async fn cmd_status(service: &E2eeService, key_id: &str) -> Result<()> {
    let key_id = KeyId::new(key_id).context("Invalid key id")?;
    let info = service
        .keys()
        .key_info(&key_id)
        .await
        .with_context(|| format!("Failed to look up {}", key_id))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn cmd_keys(service: &E2eeService, json: bool) -> Result<()> {
    let keys = service.list_keys().await.context("Failed to list keys")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    if keys.is_empty() {
        println!("No keys.");
        return Ok(());
    }
    for key in keys {
        println!(
            "  {:<40} {:<9} {:<18} expires {}",
            key.id,
            key.status,
            key.algorithm.as_str(),
            key.expires_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_expire(service: &E2eeService, key_id: Option<&str>) -> Result<()> {
    if let Some(key_id) = key_id {
        let key_id = KeyId::new(key_id).context("Invalid key id")?;
        service
            .keys()
            .expire(&key_id)
            .await
            .with_context(|| format!("Failed to expire {}", key_id))?;
        println!("Expired {}", key_id);
        return Ok(());
    }

    let expired = service
        .keys()
        .expire_due()
        .await
        .context("Failed to expire keys")?;
    println!("Expired {} key(s)", expired.len());
    for key_id in expired {
        println!("  {}", key_id);
    }
    Ok(())
}

async fn cmd_reap(service: &E2eeService) -> Result<()> {
    let reaped = service
        .reap_expired()
        .await
        .context("Failed to reap transactions")?;
    println!("Failed {} timed-out transaction(s)", reaped.len());
    Ok(())
}

fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    match input {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

fn write_output(output: Option<&Path>, data: &[u8]) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
        }
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(data)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn cli_context(operation: Operation) -> RequestContext {
    RequestContext::system(format!("cli/{}", operation))
}

async fn cmd_encrypt(
    service: &E2eeService,
    user: &str,
    input: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let user = UserId::new(user).context("Invalid user id")?;
    let plaintext = read_input(input)?;

    let tx = service
        .start_transaction(user, Operation::Encrypt, cli_context(Operation::Encrypt))
        .await
        .context("Failed to start transaction")?;
    let envelope = service
        .encrypt(&tx, &plaintext)
        .await
        .context("Encryption failed")?;
    service.complete_transaction(&tx).await?;

    let mut json = serde_json::to_vec_pretty(&envelope)?;
    json.push(b'\n');
    write_output(output, &json)?;
    info!("Encrypted {} bytes with key {}", plaintext.len(), envelope.key_id);
    Ok(())
}

async fn cmd_decrypt(
    service: &E2eeService,
    user: &str,
    input: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let user = UserId::new(user).context("Invalid user id")?;
    let envelope = Envelope::from_bytes(&read_input(input)?).context("Input is not an envelope")?;

    let tx = service
        .start_transaction_with_key(
            user,
            Operation::Decrypt,
            cli_context(Operation::Decrypt),
            &envelope.key_id,
        )
        .await
        .with_context(|| format!("Key {} cannot be used", envelope.key_id))?;
    let plaintext = service
        .decrypt(&tx, &envelope)
        .await
        .context("Decryption failed")?;
    service.complete_transaction(&tx).await?;

    write_output(output, &plaintext)
}

async fn cmd_stats(service: &E2eeService) -> Result<()> {
    let stats = service.stats().await.context("Failed to read stats")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
