use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fieldsign_core::crypto::SecureBuffer;
use fieldsign_core::queue::serve;
use fieldsign_core::{
    decrypt, platform, AuditEntry, CaptureRequest, DeviceKey, EncryptedBlob, Enrollment,
    FieldSignConfig, PendingSignatureRecord, QueueHandle, SignatureCapture, SignatureQueue,
};
use rpassword::prompt_password;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zeroize::Zeroize;

/// FieldSign CLI - operator and administrator tool for a field device
#[derive(Parser)]
#[command(name = "fieldsign")]
#[command(about = "Offline signature capture queue for field devices", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value_os_t = platform::get_default_config_path())]
    config: PathBuf,

    /// Queue database path override
    #[arg(long, global = true)]
    queue_path: Option<PathBuf>,

    /// Enrollment file path override
    #[arg(long, global = true)]
    enrollment: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a signature from a file of pad strokes
    Capture {
        /// Signature request being signed
        #[arg(long)]
        request_id: i64,

        /// Worker the signature belongs to
        #[arg(long)]
        worker_id: i64,

        /// Signer RUT
        #[arg(long)]
        rut: String,

        /// File containing the raw signature strokes
        #[arg(long)]
        signature_file: PathBuf,
    },

    /// Show queue depth and state distribution
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List unacknowledged conflicts
    Conflicts,

    /// List records that will not be retried without an operator
    Attention,

    /// Read the audit log
    Audit {
        /// Only entries for this record
        #[arg(long)]
        local_id: Option<Uuid>,

        /// Maximum entries to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Only integrity problems and escalations
        #[arg(long)]
        flagged: bool,
    },

    /// Acknowledge a conflicted or attention-needed record
    Ack {
        /// Record local id
        local_id: Uuid,
    },

    /// Show one record and the fingerprint of its decrypted signature
    Show {
        /// Record local id
        local_id: Uuid,

        /// Write the decrypted strokes to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = FieldSignConfig::load_or_default(&cli.config)?;
    if let Some(queue_path) = cli.queue_path {
        cfg.queue_path = queue_path;
    }
    if let Some(enrollment) = cli.enrollment {
        cfg.enrollment_path = enrollment;
    }

    match cli.command {
        Commands::Capture {
            request_id,
            worker_id,
            rut,
            signature_file,
        } => capture(&cfg, request_id, worker_id, rut, &signature_file).await?,
        Commands::Status { json } => status(&cfg, json)?,
        Commands::Conflicts => {
            let queue = open_read_only(&cfg)?;
            let records = queue.conflicts()?;
            if records.is_empty() {
                println!("No unacknowledged conflicts");
            }
            for record in &records {
                print_record(record);
            }
        }
        Commands::Attention => {
            let queue = open_read_only(&cfg)?;
            let records = queue.needing_attention()?;
            if records.is_empty() {
                println!("Nothing needs attention");
            }
            for record in &records {
                print_record(record);
            }
        }
        Commands::Audit {
            local_id,
            limit,
            flagged,
        } => {
            let queue = open_read_only(&cfg)?;
            let log = queue.audit();
            let entries = match (local_id, flagged) {
                (Some(id), _) => log.entries_for(&id)?,
                (None, true) => log.flagged_entries()?,
                (None, false) => log.entries(limit)?,
            };
            for entry in entries.iter().take(limit) {
                print_audit_entry(entry);
            }
        }
        Commands::Ack { local_id } => {
            let mut queue = SignatureQueue::open_secondary(&cfg.queue_path)?;
            queue.acknowledge(&local_id)?;
            println!("Acknowledged {}", local_id);
        }
        Commands::Show { local_id, output } => show(&cfg, local_id, output.as_deref())?,
    }

    Ok(())
}

async fn capture(
    cfg: &FieldSignConfig,
    request_id: i64,
    worker_id: i64,
    rut: String,
    signature_file: &Path,
) -> Result<()> {
    let enrollment = load_enrollment(cfg)?;
    let signature = std::fs::read(signature_file)
        .with_context(|| format!("reading {}", signature_file.display()))?;

    let mut pin = prompt_password("Signer PIN: ")?;
    let request = CaptureRequest {
        request_id,
        worker_id,
        rut,
        pin: pin.clone(),
        signature,
    };
    pin.zeroize();

    if let Some(parent) = cfg.queue_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let queue = SignatureQueue::open_secondary(&cfg.queue_path)?
        .with_max_queue_bytes(cfg.max_queue_bytes);

    let (handle, rx) = QueueHandle::channel(1);
    let writer = tokio::spawn(serve(queue, rx));

    let capture = SignatureCapture::new(&enrollment, handle.clone());
    let result = capture.capture(request).await;
    handle.shutdown().await?;
    writer.await?;

    let local_id = result?;
    info!(%local_id, "Capture stored");
    println!("Captured {} (request {})", local_id, request_id);
    Ok(())
}

fn status(cfg: &FieldSignConfig, json: bool) -> Result<()> {
    if !cfg.queue_path.exists() {
        println!("No queue at {}", cfg.queue_path.display());
        return Ok(());
    }
    let stats = open_read_only(cfg)?.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Pending sync:    {}", stats.pending_count);
    println!("Needs attention: {}", stats.needs_attention);
    println!("Unacknowledged:  {}", stats.unacknowledged_count);
    println!("Stored records:  {} ({} bytes)", stats.depth, stats.stored_bytes);
    for (state, count) in &stats.by_state {
        println!("  {:<11} {}", state.as_str(), count);
    }
    if !stats.by_worker.is_empty() {
        println!("Pending by worker:");
        for (worker, count) in &stats.by_worker {
            println!("  {:<11} {}", worker, count);
        }
    }
    Ok(())
}

fn show(cfg: &FieldSignConfig, local_id: Uuid, output: Option<&Path>) -> Result<()> {
    let queue = open_read_only(cfg)?;
    let record = queue
        .get(&local_id)?
        .with_context(|| format!("no record {}", local_id))?;
    print_record(&record);

    let enrollment = load_enrollment(cfg)?;
    let plaintext = open_signature(&enrollment.key(), &record.signature_blob)?;
    println!("  sha256:      {}", fingerprint(&plaintext));

    if let Some(path) = output {
        std::fs::write(path, plaintext.as_bytes())?;
        println!("  written to:  {}", path.display());
    }
    Ok(())
}

/// Decrypt a stored signature. A failure here is the same integrity fault
/// the sync engine records as `DecryptionFailed` before it would upload.
fn open_signature(key: &DeviceKey, blob: &EncryptedBlob) -> Result<SecureBuffer> {
    decrypt(key, blob).context(
        "signature failed its integrity check; the sync engine will mark it \
         DecryptionFailed on its next attempt (see `fieldsign attention`)",
    )
}

fn fingerprint(plaintext: &SecureBuffer) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn open_read_only(cfg: &FieldSignConfig) -> Result<SignatureQueue> {
    SignatureQueue::open_read_only(&cfg.queue_path)
        .with_context(|| format!("opening queue {}", cfg.queue_path.display()))
}

fn load_enrollment(cfg: &FieldSignConfig) -> Result<Enrollment> {
    Enrollment::load(&cfg.enrollment_path)
        .with_context(|| format!("loading enrollment {}", cfg.enrollment_path.display()))
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_record(record: &PendingSignatureRecord) {
    println!(
        "{}  request {}  worker {}  {}",
        record.local_id, record.request_id, record.worker_id, record.sync_state
    );
    println!("  captured:    {}", format_time(record.captured_at_local));
    println!("  attempts:    {}", record.attempt_count);
    if let Some(at) = record.last_attempt_at {
        println!("  last try:    {}", format_time(at));
    }
    if let Some(at) = record.next_attempt_at {
        println!("  next try:    {}", format_time(at));
    }
    if let Some(failure) = &record.failure {
        println!(
            "  failure:     {} ({}): {}",
            failure.error.as_str(),
            failure.kind.as_str(),
            failure.detail
        );
    }
    if let Some(conflict) = &record.conflict {
        println!(
            "  conflict:    {} at {}",
            conflict.detail,
            format_time(conflict.server_timestamp)
        );
    }
    if let Some(at) = record.acknowledged_at {
        println!("  acknowledged {}", format_time(at));
    }
}

fn print_audit_entry(entry: &AuditEntry) {
    let marker = if entry.flagged { "!" } else { " " };
    println!(
        "{} {}  {}  {:<13} {}",
        marker,
        format_time(entry.timestamp),
        entry.local_id,
        entry.event.as_str(),
        entry.detail
    );
}
