use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sesam_core::{
    import_export, platform, sync::PeerKind, DomainSettings, JsonFileSettings, SecureBuffer,
    SesamConfig, SesamError, SyncEngine, Vault,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "SESAM_MASTER_PASSWORD";

/// Exit status for a wrong master password
const EXIT_CREDENTIAL: i32 = 2;

/// Sesam - deterministic password manager
#[derive(Parser)]
#[command(name = "sesam")]
#[command(about = "Deterministic password manager with file and server sync", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Settings file holding the encrypted store, overrides the configuration
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored domains
    List,

    /// Show a domain's settings and password
    Show {
        domain: String,
    },

    /// Add a domain, or update it if it exists
    Add {
        domain: String,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Password length for a new template
        #[arg(long)]
        length: Option<usize>,

        /// Prompt for a literal password instead of generating one
        #[arg(long)]
        legacy: bool,

        /// PBKDF2 iterations
        #[arg(long)]
        iterations: Option<u32>,
    },

    /// Delete a domain (kept as a tombstone for sync)
    Delete {
        domain: String,
    },

    /// Synchronize with every enabled peer
    Sync,

    /// Overwrite the peers with the local store
    Push {
        #[arg(long, conflicts_with = "server")]
        file: bool,

        #[arg(long)]
        server: bool,
    },

    /// Export all domain settings as JSON
    ExportJson {
        path: PathBuf,
    },

    /// Export live domains with their passwords in clear text
    ExportLogins {
        path: PathBuf,
    },

    /// Import domain settings from a JSON export
    ImportJson {
        path: PathBuf,
    },

    /// Export the key generation key
    ExportKgk {
        path: PathBuf,
    },

    /// Import a key generation key
    ImportKgk {
        path: PathBuf,
    },

    /// Change the master password and push to every peer
    ChangePassword,

    /// Configure sync peers
    ConfigureSync(SyncArgs),

    /// Delete the remote copies
    DeleteRemote {
        #[arg(long)]
        yes: bool,
    },

    /// Remove all stored sync settings and domains
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Sync file path, or the default location when no path is given;
    /// enables the file peer
    #[arg(long, num_args = 0..=1)]
    file: Option<Option<PathBuf>>,

    /// Disable the file peer
    #[arg(long, conflicts_with = "file")]
    no_file: bool,

    /// Server root URL; enables the server peer
    #[arg(long)]
    server: Option<String>,

    /// Disable the server peer
    #[arg(long, conflicts_with = "server")]
    no_server: bool,

    #[arg(long)]
    username: Option<String>,

    /// Prompt for the server password
    #[arg(long)]
    server_password: bool,

    /// PEM file with the trusted root certificates
    #[arg(long)]
    root_certificates: Option<PathBuf>,

    /// Accept server certificates that do not verify
    #[arg(long)]
    insecure: bool,

    /// Sync before listing domains
    #[arg(long)]
    sync_on_start: Option<bool>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        if let Some(sesam_err) = err.downcast_ref::<SesamError>() {
            if sesam_err.is_credential_error() {
                eprintln!("Wrong master password or corrupted data");
                std::process::exit(EXIT_CREDENTIAL);
            }
        }
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(platform::get_default_config_path);
    let mut config = SesamConfig::load(&config_path)?;
    if let Some(settings) = cli.settings {
        config.settings_path = settings;
    }
    debug!("Settings file: {}", config.settings_path.display());

    if let Commands::Clear { yes } = cli.command {
        return clear(config, yes);
    }

    let vault = open_vault(config).await?;
    let engine = SyncEngine::new(Arc::clone(&vault));

    match cli.command {
        Commands::List => {
            let sync_first = {
                let vault = vault.lock().await;
                vault.sync_config().sync_on_start && vault.sync_config().any_peer_enabled()
            };
            if sync_first {
                sync(&engine).await?;
            }
            let vault = vault.lock().await;
            for ds in vault.domains()?.iter().filter(|ds| !ds.deleted) {
                if ds.user_name.is_empty() {
                    println!("{}", ds.domain_name);
                } else {
                    println!("{}  ({})", ds.domain_name, ds.user_name);
                }
            }
        }
        Commands::Show { domain } => {
            let vault = vault.lock().await;
            let ds = vault
                .domains()?
                .get(&domain)
                .filter(|ds| !ds.deleted)
                .cloned()
                .ok_or_else(|| SesamError::NotFound(domain.clone()))?;
            print_domain(&ds);
            println!("password:   {}", vault.password_for(&domain)?);
        }
        Commands::Add {
            domain,
            user,
            url,
            notes,
            length,
            legacy,
            iterations,
        } => {
            let mut vault = vault.lock().await;
            let mut ds = match vault.domains()?.get(&domain) {
                Some(existing) if !existing.deleted => existing.clone(),
                _ => vault.new_domain(&domain)?,
            };
            if let Some(user) = user {
                ds.user_name = user;
            }
            if let Some(url) = url {
                ds.url = url;
            }
            if let Some(notes) = notes {
                ds.notes = notes;
            }
            if let Some(iterations) = iterations {
                ds.iterations = iterations;
            }
            if let Some(length) = length {
                ds.password_template = sesam_core::crypto::make_template(
                    length,
                    vault.config().default_template_classes,
                )?;
            }
            if legacy {
                let literal = Zeroizing::new(rpassword::prompt_password("Password: ")?);
                ds.legacy_password = literal.to_string();
            }
            vault.save_domain(ds).await?;
            println!("{}", vault.password_for(&domain)?);
        }
        Commands::Delete { domain } => {
            vault.lock().await.delete_domain(&domain).await?;
            info!("Deleted {}", domain);
        }
        Commands::Sync => {
            sync(&engine).await?;
        }
        Commands::Push { file, server } => {
            let only = match (file, server) {
                (true, _) => Some(PeerKind::File),
                (_, true) => Some(PeerKind::Server),
                _ => None,
            };
            let pushed = engine.force_push_all(only).await?;
            if pushed == 0 {
                bail!("No matching sync peer is enabled");
            }
            println!("Pushed to {} peer(s)", pushed);
        }
        Commands::ExportJson { path } => {
            import_export::export_json_to_file(&*vault.lock().await, &path)?;
        }
        Commands::ExportLogins { path } => {
            import_export::export_logins_to_file(&*vault.lock().await, &path)?;
            warn!("{} contains clear-text passwords", path.display());
        }
        Commands::ImportJson { path } => {
            let renamed = import_export::import_json_file(&mut *vault.lock().await, &path).await?;
            for (original, stored) in renamed {
                println!("{} imported as {}", original, stored);
            }
        }
        Commands::ExportKgk { path } => {
            let cipher = vault.lock().await.export_kgk()?;
            std::fs::write(&path, cipher)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            info!("KGK exported to {}", path.display());
        }
        Commands::ImportKgk { path } => {
            let cipher =
                std::fs::read(&path).with_context(|| format!("Cannot read {}", path.display()))?;
            let password = prompt_secret("Password of the KGK file: ")?;
            vault.lock().await.import_kgk(cipher, password).await?;
            info!("KGK imported from {}", path.display());
        }
        Commands::ChangePassword => {
            let old = prompt_secret("Current master password: ")?;
            let new = prompt_new_password()?;
            vault.lock().await.change_master_password(old, new).await?;
            let pushed = engine.force_push_all(None).await?;
            info!("Master password changed, pushed to {} peer(s)", pushed);
        }
        Commands::ConfigureSync(args) => {
            configure_sync(&vault, args).await?;
        }
        Commands::DeleteRemote { yes } => {
            if !yes {
                bail!("Refusing to delete remote data without --yes");
            }
            engine.delete_remote().await?;
        }
        // Handled before unlocking.
        Commands::Clear { .. } => {}
    }

    vault.lock().await.lock();
    Ok(())
}

async fn open_vault(config: SesamConfig) -> Result<Arc<Mutex<Vault>>> {
    let settings = JsonFileSettings::open(&config.settings_path)
        .with_context(|| format!("Cannot open {}", config.settings_path.display()))?;
    let mut vault = Vault::new(Box::new(settings), config);

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(value) => SecureBuffer::from_string(value),
        Err(_) if vault.has_stored_data() => prompt_secret("Master password: ")?,
        Err(_) => {
            println!("No stored data found, choose a master password.");
            prompt_new_password()?
        }
    };
    vault.unlock(password).await?;
    Ok(Arc::new(Mutex::new(vault)))
}

async fn sync(engine: &SyncEngine) -> Result<()> {
    let results = engine.sync_all().await?;
    if results.is_empty() {
        warn!("No sync peer is enabled");
    }
    for (kind, result) in results {
        match result {
            Ok(outcome) => {
                if outcome.kgk_replaced {
                    warn!("The {} peer uses a different KGK, it is now active here", kind);
                }
                for name in &outcome.converted {
                    println!("{} now uses a stored legacy password", name);
                }
                println!(
                    "{}: local {}, remote {}",
                    kind,
                    if outcome.local_changed { "updated" } else { "unchanged" },
                    if outcome.remote_changed || outcome.bootstrapped {
                        "updated"
                    } else {
                        "unchanged"
                    },
                );
            }
            Err(e) if e.is_credential_error() => return Err(e.into()),
            Err(e) => eprintln!("{}: {}", kind, e),
        }
    }
    Ok(())
}

async fn configure_sync(vault: &Arc<Mutex<Vault>>, args: SyncArgs) -> Result<()> {
    let mut vault = vault.lock().await;
    let mut sync_config = vault.sync_config().clone();

    if let Some(file) = args.file {
        let file = file.unwrap_or_else(platform::get_default_sync_file_path);
        sync_config.sync_file = file.display().to_string();
        sync_config.use_sync_file = true;
    }
    if args.no_file {
        sync_config.use_sync_file = false;
    }
    if let Some(server) = args.server {
        sync_config.server_root = server;
        sync_config.use_sync_server = true;
    }
    if args.no_server {
        sync_config.use_sync_server = false;
    }
    if let Some(username) = args.username {
        sync_config.server_username = username;
    }
    if args.server_password {
        let password = Zeroizing::new(rpassword::prompt_password("Server password: ")?);
        sync_config.server_password = password.to_string();
    }
    if let Some(path) = args.root_certificates {
        sync_config.root_certificates = read_pem(&path)?;
    }
    if args.insecure {
        warn!("Server certificates will not be verified");
        sync_config.server_secure = false;
    }
    if let Some(on_start) = args.sync_on_start {
        sync_config.sync_on_start = on_start;
    }

    vault.save_sync_config(sync_config).await?;
    info!("Sync configuration saved");
    Ok(())
}

fn clear(config: SesamConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear all data without --yes");
    }
    let settings = JsonFileSettings::open(&config.settings_path)?;
    let mut vault = Vault::new(Box::new(settings), config);
    vault.clear_all()?;
    println!("All stored domains and sync settings removed");
    Ok(())
}

fn print_domain(ds: &DomainSettings) {
    println!("domain:     {}", ds.domain_name);
    if !ds.user_name.is_empty() {
        println!("user:       {}", ds.user_name);
    }
    if !ds.url.is_empty() {
        println!("url:        {}", ds.url);
    }
    if !ds.notes.is_empty() {
        println!("notes:      {}", ds.notes);
    }
    if !ds.is_legacy() {
        println!("iterations: {}", ds.iterations);
        println!("template:   {}", ds.password_template);
    }
    if let Some(modified) = ds.modified_date.or(ds.created_date) {
        println!("modified:   {}", modified.format("%Y-%m-%d %H:%M:%S"));
    }
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))
}

fn prompt_secret(prompt: &str) -> Result<SecureBuffer> {
    Ok(SecureBuffer::from_string(rpassword::prompt_password(prompt)?))
}

fn prompt_new_password() -> Result<SecureBuffer> {
    let first = prompt_secret("New master password: ")?;
    if first.is_empty() {
        bail!("The master password must not be empty");
    }
    let second = prompt_secret("Repeat: ")?;
    if !first.ct_eq(&second) {
        bail!("Passwords do not match");
    }
    Ok(first)
}
