//! dMsg key tool.
//!
//! # Usage
//!
//! ```bash
//! # Stretch a password the way a Local or ECDH master key does
//! dmsg-keytool stretch --password "correct horse" --salt alice
//!
//! # Run the full key flow against in-memory stores
//! dmsg-keytool selftest --seed 7
//! ```

#![allow(clippy::print_stdout, reason = "CLI output")]

mod selftest;

use clap::{Parser, Subcommand};
use dmsg_crypto::{PasswordParams, password_hash, stretch_password};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// dMsg key management tool
#[derive(Parser, Debug)]
#[command(name = "dmsg-keytool")]
#[command(about = "dMsg key management tool")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Argon2id memory cost in KiB
    #[arg(long, global = true, default_value_t = PasswordParams::default().memory_kib)]
    memory_kib: u32,

    /// Argon2id passes
    #[arg(long, global = true, default_value_t = PasswordParams::default().time_cost)]
    time_cost: u32,

    /// Argon2id parallelism
    #[arg(long, global = true, default_value_t = PasswordParams::default().parallelism)]
    parallelism: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stretch a password and print the secret and its published hash
    Stretch {
        /// Password to stretch
        #[arg(short, long)]
        password: String,

        /// Salt namespace, usually the user's textual principal
        #[arg(short, long)]
        salt: String,

        /// Master key id the password hash is bound to
        #[arg(long, default_value = "v1")]
        key_id: String,
    },

    /// Run the end-to-end key flow against in-memory stores
    Selftest {
        /// Seed for the simulated environment and stores
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

impl Args {
    fn password_params(&self) -> PasswordParams {
        PasswordParams {
            memory_kib: self.memory_kib,
            time_cost: self.time_cost,
            parallelism: self.parallelism,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let params = args.password_params();
    match args.command {
        Command::Stretch { password, salt, key_id } => {
            tracing::debug!(salt = %salt, "stretching password");
            let stretched = stretch_password(password.as_bytes(), salt.as_bytes(), &params)?;
            let hash = password_hash(&stretched[..], key_id.as_bytes());

            println!("stretched:     {}", hex::encode(&stretched[..]));
            println!("password_hash: {}", hex::encode(hash));
        },
        Command::Selftest { seed } => {
            tracing::info!(seed, "self-test starting");
            selftest::run(seed, params).await?;
            println!("self-test passed");
        },
    }

    Ok(())
}
