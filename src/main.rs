use anyhow::Result;
use clap::{Parser, Subcommand};
use cloakfs::config::{self, VolumeParams};
use cloakfs::store::PosixStore;
use std::fs;
use std::time::Duration;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an encrypted volume in a backing directory
    Init {
        /// The directory that will hold the encrypted tree
        backing: String,

        /// Use the paranoia profile (block MACs, chained name IVs)
        #[clap(long, default_value_t = false)]
        paranoia: bool,

        /// Target wall-clock time for password derivation, in milliseconds
        #[clap(long, default_value_t = 500)]
        kdf_ms: u64,
    },
    /// Print the public parameters of an existing volume
    Info {
        /// The directory holding the encrypted tree
        backing: String,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Args::parse().command {
        Command::Init {
            backing,
            paranoia,
            kdf_ms,
        } => {
            let _ = fs::create_dir_all(&backing);
            let store = PosixStore::new(&backing)?;

            let password = rpassword::prompt_password("volume password: ")?;
            let confirm = rpassword::prompt_password("confirm password: ")?;
            anyhow::ensure!(password == confirm, "passwords do not match");

            let mut params = if paranoia {
                VolumeParams::paranoia()
            } else {
                VolumeParams::standard()
            };
            params.kdf_target = Duration::from_millis(kdf_ms);
            config::create_volume(&store, password.as_bytes(), &params)?;
            println!("volume created in {backing}");
        }
        Command::Info { backing } => {
            let store = PosixStore::new(&backing)?;
            let cfg = config::load_config(&store)?;
            println!("format version:  {}", cfg.version);
            println!("cipher:          {}-{}", cfg.cipher_name, cfg.key_bits);
            println!("block size:      {}", cfg.block_size);
            println!("name codec:      {}", cfg.name_alg);
            println!("per-file IV:     {}", cfg.unique_iv);
            println!("chained name IV: {}", cfg.chained_name_iv);
            println!("block MAC bytes: {}", cfg.block_mac_bytes);
            println!("random bytes:    {}", cfg.block_mac_rand_bytes);
            println!("allow holes:     {}", cfg.allow_holes);
            println!("KDF iterations:  {}", cfg.kdf_iterations);
            println!("volume id:       {}", hex::encode(&cfg.unique_volume_id));
        }
    }
    Ok(())
}
