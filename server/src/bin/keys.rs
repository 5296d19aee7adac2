//! Key management for servers and update publishers

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use shared::sign::{StreamSigner, SIGNING_KEY_LEN};
use shared::{Keypair, UPDATE_CHUNK_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an X25519 transport keypair for a room or update server
    GenKx,
    /// Generate an Ed25519 keypair for signing updates
    GenSign,
    /// Sign an update payload, printing the signature as hex
    Sign {
        /// Hex Ed25519 secret key
        #[arg(short, long)]
        key: String,
        /// Payload file
        payload: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Args::parse().command {
        Command::GenKx => {
            let keypair = Keypair::generate();
            println!("secret: {}", hex::encode(*keypair.secret_bytes()));
            println!("public: {}", keypair.public_key().to_hex());
        }
        Command::GenSign => {
            let key = SigningKey::generate(&mut OsRng);
            println!("secret: {}", hex::encode(key.to_bytes()));
            println!("public: {}", hex::encode(key.verifying_key().to_bytes()));
        }
        Command::Sign { key, payload } => {
            let mut secret = [0u8; SIGNING_KEY_LEN];
            hex::decode_to_slice(key.trim(), &mut secret)?;
            let key = SigningKey::from_bytes(&secret);

            let data = fs::read(&payload)?;
            let mut signer = StreamSigner::new();
            for chunk in data.chunks(UPDATE_CHUNK_SIZE) {
                signer.update(chunk);
            }
            println!("{}", hex::encode(signer.sign(&key)?));
            log::info!("Signed {} bytes from {}", data.len(), payload.display());
        }
    }
    Ok(())
}
