use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blockvault::crypto::kdf;
use blockvault::{
    CipherKind, EncryptionKey, KnownBlockVersions, Vault, VaultConfig, VaultOptions, ALL_CIPHERS,
};

#[derive(Parser)]
#[command(name = "blockvault", version, about = "Encrypting, tamper-evident block store CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new vault directory
    Create {
        /// Vault root (the untrusted side; safe to sync anywhere)
        basedir: PathBuf,
        /// Local state directory (the trusted side; keep it private)
        #[arg(long)]
        state_dir: PathBuf,
        /// Cipher: aes-256-gcm (default) or any name from `ciphers`
        #[arg(short, long, default_value = "aes-256-gcm")]
        cipher: String,
        /// Required to select a cipher that does not authenticate
        /// ciphertexts (the CFB modes)
        #[arg(long)]
        allow_insecure_cipher: bool,
        /// Expect this to stay a single-writer vault; enables
        /// missing-block detection
        #[arg(long)]
        exclusive: bool,
        #[arg(short, long)]
        password: String,
    },
    /// Show block count and free-space estimate
    Stats {
        basedir: PathBuf,
        #[arg(long)]
        state_dir: PathBuf,
        #[arg(short, long)]
        password: String,
    },
    /// Walk every block through the full stack and report tampering
    Check {
        basedir: PathBuf,
        #[arg(long)]
        state_dir: PathBuf,
        #[arg(short, long)]
        password: String,
    },
    /// Clear the sticky integrity-violation flag after reviewing an incident
    ResetIntegrity {
        /// The integrity state file (state_dir/integrity-<filesystem-id>.state)
        state_file: PathBuf,
    },
    /// List the supported cipher names
    Ciphers,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    match run(Cli::parse().command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create {
            basedir,
            state_dir,
            cipher,
            allow_insecure_cipher,
            exclusive,
            password,
        } => {
            let kind = CipherKind::from_name(&cipher)?;
            if let Some(warning) = kind.integrity_warning() {
                if !allow_insecure_cipher {
                    eprintln!("{warning}");
                    eprintln!("Pass --allow-insecure-cipher to use {cipher} anyway.");
                    return Ok(ExitCode::FAILURE);
                }
                eprintln!("Warning: {warning}");
            }

            let mut config = VaultConfig::new(kind);
            let key = derive_key(&password, &config, kind)?;
            let client_id = blockvault::local_state::load_or_generate_client_id(&state_dir)?;
            if exclusive {
                config.exclusive_client_id = Some(client_id);
            }
            let vault = Vault::create(&basedir, &state_dir, config, key, VaultOptions::default())?;

            println!("Created vault: {}", basedir.display());
            println!("  Cipher         {}", vault.config().cipher);
            println!("  Filesystem id  {}", vault.config().filesystem_id);
            println!("  Client id      {}", vault.my_client_id());
            Ok(ExitCode::SUCCESS)
        }

        // ── Stats ────────────────────────────────────────────────────────────
        Commands::Stats {
            basedir,
            state_dir,
            password,
        } => {
            let vault = open_vault(&basedir, &state_dir, &password, VaultOptions::default())?;
            let store = vault.block_store();
            let num_blocks = store.num_blocks()?;
            let free = store.estimate_num_free_bytes()?;

            println!("── Vault ────────────────────────────────────────────────");
            println!("  Path           {}", basedir.display());
            println!("  Cipher         {}", vault.config().cipher);
            println!("  Filesystem id  {}", vault.config().filesystem_id);
            println!("  Blocks         {num_blocks}");
            println!("  Free space     {} B ({:.2} GiB)", free, free as f64 / 1073741824.0);
            Ok(ExitCode::SUCCESS)
        }

        // ── Check ────────────────────────────────────────────────────────────
        Commands::Check {
            basedir,
            state_dir,
            password,
        } => {
            let violation_count = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&violation_count);
            let options = VaultOptions {
                allow_integrity_violations: false,
                on_integrity_violation: Box::new(move |reason| {
                    eprintln!("INTEGRITY VIOLATION: {reason}");
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            };
            let vault = open_vault(&basedir, &state_dir, &password, options)?;
            let store = vault.block_store();

            let mut ids = Vec::new();
            store.for_each_block(&mut |id| ids.push(*id))?;

            let mut ok = 0usize;
            let mut unreadable = Vec::new();
            for id in &ids {
                match store.load(id)? {
                    Some(_) => ok += 1,
                    None => unreadable.push(*id),
                }
            }

            println!("Checked {} block(s): {} readable", ids.len(), ok);
            for id in &unreadable {
                println!("  unreadable: {id}");
            }
            if violation_count.load(Ordering::SeqCst) > 0 || !unreadable.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Reset-integrity ──────────────────────────────────────────────────
        Commands::ResetIntegrity { state_file } => {
            if KnownBlockVersions::reset_integrity_violation_flag(&state_file)? {
                println!("Cleared the integrity-violation flag in {}", state_file.display());
            } else {
                println!("No integrity-violation flag was set in {}", state_file.display());
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Ciphers ──────────────────────────────────────────────────────────
        Commands::Ciphers => {
            for kind in ALL_CIPHERS {
                match kind.integrity_warning() {
                    None => println!("{}", kind.name()),
                    Some(_) => println!("{}  (not integrity-protecting)", kind.name()),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_vault(
    basedir: &PathBuf,
    state_dir: &PathBuf,
    password: &str,
    options: VaultOptions,
) -> Result<Vault, Box<dyn std::error::Error>> {
    let config = VaultConfig::load(&basedir.join(blockvault::CONFIG_FILE_NAME))?;
    let kind = config.cipher_kind()?;
    let key = derive_key(password, &config, kind)?;
    Ok(Vault::open(basedir, state_dir, key, options)?)
}

/// Key = Argon2id(password, salt = filesystem id), sized for the cipher.
fn derive_key(
    password: &str,
    config: &VaultConfig,
    kind: CipherKind,
) -> Result<EncryptionKey, Box<dyn std::error::Error>> {
    Ok(kdf::derive_key(
        password,
        config.filesystem_id.as_bytes(),
        kind.key_len(),
    )?)
}
