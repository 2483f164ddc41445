//! OcuScan CLI - Command line interface for the offline-first record store.
//!
//! This tool records users, patients and scans locally and mirrors pending
//! records to the configured remote backend on demand or whenever the
//! network comes back.

mod config;
mod probe;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ocuscan_common::{
    NewPatient, NewScan, NewUser, PatientUpdate, RecordId, ScanUpdate, Secret, SyncFlag,
};
use ocuscan_mirror::{MirrorRegistry, RemoteMirror};
use ocuscan_store::LocalStore;
use ocuscan_sync::{ConnectivityMonitor, SyncOrchestrator, SyncOutcome, SyncService, Trigger};

use crate::config::{default_config_path, AppConfig};

#[derive(Parser)]
#[command(name = "ocuscan")]
#[command(about = "OcuScan - Offline-first clinical record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: platform data directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the local database.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Manage user accounts.
    #[command(subcommand)]
    User(UserCommand),

    /// Manage patients.
    #[command(subcommand)]
    Patient(PatientCommand),

    /// Manage scans.
    #[command(subcommand)]
    Scan(ScanCommand),

    /// Show pending and synced counts per record kind.
    Status,

    /// Run one sync pass.
    Sync {
        /// Treat the device as offline.
        #[arg(long)]
        offline: bool,
    },

    /// Probe connectivity and sync on every reconnect until Ctrl-C.
    Watch,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a user account.
    Add {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "")]
        organization: String,

        #[arg(short, long, default_value = "doctor")]
        role: String,
    },

    /// Check a user's credentials against the local store.
    Login {
        #[arg(short, long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum PatientCommand {
    /// Register a patient.
    Add {
        /// Record number, unique per installation.
        #[arg(short, long)]
        record_number: String,

        #[arg(short, long)]
        name: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Edit a patient's details.
    Update {
        /// Local patient id.
        id: i64,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List patients, newest first.
    List,
}

#[derive(Subcommand)]
enum ScanCommand {
    /// Record a scan for a patient.
    Add {
        /// Local patient id.
        #[arg(short, long)]
        patient: i64,

        /// Image path or URI.
        #[arg(short, long)]
        image: String,

        #[arg(short, long)]
        diagnosis: Option<String>,

        /// Confidence score between 0 and 1.
        #[arg(long)]
        confidence: Option<f64>,
    },

    /// Set a scan's diagnosis.
    Update {
        /// Local scan id.
        id: i64,

        #[arg(short, long)]
        diagnosis: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,
    },

    /// List a patient's scans, newest first.
    List {
        #[arg(short, long)]
        patient: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "ocuscan", &mut std::io::stdout());
        return Ok(());
    }

    if let Commands::Init { force } = cli.command {
        return cmd_init(cli.config.as_deref(), force);
    }

    let config = AppConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::User(UserCommand::Add {
            email,
            name,
            organization,
            role,
        }) => cmd_user_add(&config, &email, &name, &organization, &role),

        Commands::User(UserCommand::Login { email }) => cmd_user_login(&config, &email),

        Commands::Patient(PatientCommand::Add {
            record_number,
            name,
            notes,
        }) => cmd_patient_add(&config, &record_number, &name, &notes),

        Commands::Patient(PatientCommand::Update { id, name, notes }) => {
            cmd_patient_update(&config, id, name, notes)
        }

        Commands::Patient(PatientCommand::List) => cmd_patient_list(&config),

        Commands::Scan(ScanCommand::Add {
            patient,
            image,
            diagnosis,
            confidence,
        }) => cmd_scan_add(&config, patient, &image, diagnosis, confidence),

        Commands::Scan(ScanCommand::Update {
            id,
            diagnosis,
            confidence,
        }) => cmd_scan_update(&config, id, diagnosis, confidence),

        Commands::Scan(ScanCommand::List { patient }) => cmd_scan_list(&config, patient),

        Commands::Status => cmd_status(&config),

        Commands::Sync { offline } => cmd_sync(&config, offline).await,

        Commands::Watch => cmd_watch(&config).await,

        Commands::Init { .. } | Commands::Completions { .. } => Ok(()),
    }
}

/// Prompt for a credential secret securely.
fn prompt_secret(prompt: &str) -> Result<Secret> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Secret::new(secret))
}

fn open_store(config: &AppConfig) -> Result<LocalStore> {
    LocalStore::open(&config.database, config.store.clone()).with_context(|| {
        format!(
            "Failed to open local store at {}",
            config.database.display()
        )
    })
}

fn open_mirror(config: &AppConfig) -> Result<Arc<dyn RemoteMirror>> {
    MirrorRegistry::default()
        .resolve(&config.mirror.provider, config.mirror.config.clone())
        .with_context(|| format!("Failed to set up mirror '{}'", config.mirror.provider))
}

fn flag(sync: SyncFlag) -> &'static str {
    match sync {
        SyncFlag::Pending => "pending",
        SyncFlag::Synced => "synced",
    }
}

/// Write the default config and create the database.
fn cmd_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    let config = if path.exists() && !force {
        info!("Keeping existing config at {}", path.display());
        AppConfig::load(&path)?
    } else {
        let config = AppConfig::default();
        config.save(&path)?;
        config
    };

    open_store(&config)?;
    open_mirror(&config)?;

    println!("OcuScan initialized.");
    println!("  Config: {}", path.display());
    println!("  Database: {}", config.database.display());
    println!("  Mirror: {}", config.mirror.provider);

    Ok(())
}

fn cmd_user_add(
    config: &AppConfig,
    email: &str,
    name: &str,
    organization: &str,
    role: &str,
) -> Result<()> {
    let secret = prompt_secret("Enter password: ")?;
    let confirm = prompt_secret("Confirm password: ")?;

    if secret != confirm {
        anyhow::bail!("Passwords do not match");
    }

    let new = NewUser::new(email, secret, name, organization, role).context("Invalid user")?;
    let store = open_store(config)?;
    let user = store.create_user(&new).context("Failed to create user")?;

    println!("User created: {} (id {})", user.email, user.id);
    println!("  Sync: {}", flag(user.sync));

    Ok(())
}

fn cmd_user_login(config: &AppConfig, email: &str) -> Result<()> {
    let secret = prompt_secret("Enter password: ")?;
    let store = open_store(config)?;

    match store.authenticate_user(email, &secret)? {
        Some(user) => {
            println!("Signed in as {} ({})", user.full_name, user.role);
            Ok(())
        }
        None => anyhow::bail!("Invalid email or password"),
    }
}

fn cmd_patient_add(config: &AppConfig, record_number: &str, name: &str, notes: &str) -> Result<()> {
    let new = NewPatient::new(record_number, name, notes).context("Invalid patient")?;
    let store = open_store(config)?;
    let patient = store
        .create_patient(&new)
        .context("Failed to create patient")?;

    println!(
        "Patient created: {} (id {}, {})",
        patient.record_number,
        patient.id,
        flag(patient.sync)
    );

    Ok(())
}

fn cmd_patient_update(
    config: &AppConfig,
    id: i64,
    name: Option<String>,
    notes: Option<String>,
) -> Result<()> {
    let update = PatientUpdate {
        full_name: name,
        notes,
    };
    let store = open_store(config)?;
    let patient = store
        .update_patient(RecordId::new(id), &update)
        .context("Failed to update patient")?;

    println!(
        "Patient updated: {} (revision {}, {})",
        patient.record_number,
        patient.revision,
        flag(patient.sync)
    );

    Ok(())
}

fn cmd_patient_list(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let patients = store.list_patients()?;

    if patients.is_empty() {
        println!("No patients.");
        return Ok(());
    }

    for patient in patients {
        println!(
            "  [{}] {:<12} {:<24} {:<8} {}",
            patient.id,
            patient.record_number,
            patient.full_name,
            flag(patient.sync),
            patient.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

fn cmd_scan_add(
    config: &AppConfig,
    patient: i64,
    image: &str,
    diagnosis: Option<String>,
    confidence: Option<f64>,
) -> Result<()> {
    let new = NewScan::new(RecordId::new(patient), image, diagnosis, confidence)
        .context("Invalid scan")?;
    let store = open_store(config)?;
    let scan = store.create_scan(&new).context("Failed to create scan")?;

    println!(
        "Scan created: id {} for patient {} ({})",
        scan.id,
        scan.patient_record_number,
        flag(scan.sync)
    );

    Ok(())
}

fn cmd_scan_update(
    config: &AppConfig,
    id: i64,
    diagnosis: Option<String>,
    confidence: Option<f64>,
) -> Result<()> {
    let update = ScanUpdate {
        diagnosis,
        confidence,
    };
    let store = open_store(config)?;
    let scan = store
        .update_scan(RecordId::new(id), &update)
        .context("Failed to update scan")?;

    println!(
        "Scan updated: id {} (revision {}, {})",
        scan.id,
        scan.revision,
        flag(scan.sync)
    );

    Ok(())
}

fn cmd_scan_list(config: &AppConfig, patient: i64) -> Result<()> {
    let store = open_store(config)?;
    let scans = store.scans_for_patient(RecordId::new(patient))?;

    if scans.is_empty() {
        println!("No scans.");
        return Ok(());
    }

    for scan in scans {
        let diagnosis = scan.diagnosis.as_deref().unwrap_or("-");
        let confidence = scan
            .confidence
            .map(|c| format!("{:.2}", c))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {:<16} {:>5} {:<8} {}",
            scan.id,
            diagnosis,
            confidence,
            flag(scan.sync),
            scan.image_ref
        );
    }

    Ok(())
}

fn cmd_status(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;

    println!("Sync status:");
    for status in store.status()? {
        println!(
            "  {:<8} {} pending, {} synced",
            status.kind.as_str(),
            status.pending,
            status.synced
        );
    }

    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Busy => println!("Sync already running."),
        SyncOutcome::Offline => println!("Offline, nothing pushed."),
        SyncOutcome::Completed(report) | SyncOutcome::Aborted(report) => {
            println!(
                "Sync {:?} in {:?}: {} of {} pushed",
                report.trigger,
                report.duration,
                report.synced(),
                report.attempted()
            );
            for kind in &report.kinds {
                println!(
                    "  {:<8} {} synced, {} failed, {} needs sign-in, {} changed",
                    kind.kind.as_str(),
                    kind.synced,
                    kind.failed,
                    kind.auth_skipped,
                    kind.stale
                );
            }
            if let Some(reason) = &report.aborted {
                println!("  Aborted: {}", reason);
            }
        }
    }
}

/// Run one sync pass.
async fn cmd_sync(config: &AppConfig, offline: bool) -> Result<()> {
    let store = open_store(config)?;
    let mirror = open_mirror(config)?;
    let monitor = ConnectivityMonitor::new(!offline);
    let orchestrator = SyncOrchestrator::new(store, mirror, monitor, &config.sync);

    let outcome = orchestrator.request_sync(Trigger::Manual).await;
    print_outcome(&outcome);

    if let SyncOutcome::Aborted(_) = outcome {
        anyhow::bail!("Sync aborted");
    }

    Ok(())
}

/// Sync at startup and on every reconnect until Ctrl-C.
async fn cmd_watch(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let mirror = open_mirror(config)?;

    let limit = Duration::from_millis(config.probe.timeout_ms);
    let online = probe::reachable(&config.probe.address, limit).await;
    let monitor = ConnectivityMonitor::new(online);

    let service = SyncService::start(store, mirror, monitor.clone(), config.sync.clone())
        .context("Failed to start sync service")?;

    println!(
        "Watching connectivity via {} (online: {}). Press Ctrl-C to stop.",
        config.probe.address, online
    );

    if let Some(outcome) = service.startup_outcome().await {
        print_outcome(&outcome);
    }

    let mut events = service.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(outcome) = events.recv().await {
            print_outcome(&outcome);
        }
    });

    probe::run(monitor, config.probe.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await;

    drop(service);
    printer.abort();
    println!("Stopped.");

    Ok(())
}
