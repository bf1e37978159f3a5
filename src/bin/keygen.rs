//! RSA-2048 keypair generator for the server and client binaries.
//!
//! Both `server` and `client` call `KeyPair::load_or_generate` on startup
//! and never need this tool in normal operation; it exists for seeding a
//! deployment's key material up front, or regenerating a single node's
//! identity without touching the rest of its state.

use clap::Parser;
use neighbourhood::crypto::KeyPair;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Generate an RSA-2048 keypair for a Neighbourhood node")]
struct Args {
    /// Directory to write `private_key.pem` and `public_key.pem` into.
    #[arg(short, long, default_value = "./keys")]
    output: PathBuf,

    /// Overwrite existing key files if present.
    #[arg(short, long)]
    force: bool,
}

fn main() {
    let args = Args::parse();

    let private_path = args.output.join("private_key.pem");
    let public_path = args.output.join("public_key.pem");

    if !args.force && (private_path.exists() || public_path.exists()) {
        eprintln!(
            "refusing to overwrite existing key material at {} (pass --force to replace it)",
            args.output.display()
        );
        std::process::exit(1);
    }

    let keys = match KeyPair::generate() {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("key generation failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&args.output) {
        eprintln!("failed to create {}: {e}", args.output.display());
        std::process::exit(1);
    }

    let write = |path: &PathBuf, contents: String| {
        if let Err(e) = std::fs::write(path, contents) {
            eprintln!("failed to write {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    write(&private_path, keys.private_pem().expect("freshly generated key encodes"));
    write(&public_path, keys.public_pem().expect("freshly generated key encodes"));

    let fingerprint = keys.fingerprint().expect("freshly generated key fingerprints");
    println!("wrote {}", private_path.display());
    println!("wrote {}", public_path.display());
    println!("fingerprint: {fingerprint}");
}
