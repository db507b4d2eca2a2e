use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use tracing::info;

use tokenledger::{
    store, Address, Amount, CallBatch, Ledger, LedgerCall, LedgerEvent,
};

//==================== CLI ====================//

#[derive(Parser)]
#[command(name = "tokenledger")]
#[command(about = "Fungible token ledger: balances, allowances, transfers", version)]
struct Cli {
    /// Ledger state file
    #[arg(
        long,
        global = true,
        env = "TOKENLEDGER_STATE",
        default_value = "ledger.json"
    )]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a ledger crediting the whole supply to the creator
    Init {
        #[arg(long)]
        supply: Amount,
        #[arg(long)]
        creator: Address,
        /// Replace an existing state file
        #[arg(long)]
        force: bool,
    },
    /// Print the total supply
    Supply,
    /// Print an account's balance
    Balance { account: Address },
    /// Print what SPENDER may still move out of OWNER's balance
    Allowance { owner: Address, spender: Address },
    /// Set the allowance of SPENDER over the caller's balance
    Approve {
        #[arg(long)]
        caller: Address,
        spender: Address,
        amount: Amount,
    },
    /// Move tokens from the caller to TO
    Transfer {
        #[arg(long)]
        caller: Address,
        to: Address,
        amount: Amount,
    },
    /// Move tokens from FROM to TO using the caller's allowance
    TransferFrom {
        #[arg(long)]
        caller: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
    /// Apply a JSON batch of calls, all or nothing
    Apply {
        #[arg(value_name = "FILE")]
        batch: PathBuf,
    },
    /// Print (or write) the state snapshot with its merkle root
    Snapshot {
        #[arg(short, long, value_name = "OUT")]
        out: Option<PathBuf>,
    },
    /// Check the state file's merkle root and supply conservation
    Verify,
    /// Generate an Ed25519 keypair and print its account address
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
}

//==================== helpers ====================//

fn write_all(p: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(p, bytes).with_context(|| format!("write {}", p.display()))
}

/// Writes key material readable by the owner only (0600 on Unix).
fn write_secret(p: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options
        .open(p)
        .with_context(|| format!("create {}", p.display()))?;
    #[cfg(unix)]
    {
        // `mode` only applies on creation; tighten a pre-existing file too.
        use std::os::unix::fs::PermissionsExt;
        f.set_permissions(fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", p.display()))?;
    }
    f.write_all(bytes)
        .with_context(|| format!("write {}", p.display()))
}

fn load(state: &Path) -> anyhow::Result<Ledger> {
    store::load(state).with_context(|| {
        format!(
            "cannot open ledger (run `tokenledger init` or pass --state); path {}",
            state.display()
        )
    })
}

fn print_event(event: &LedgerEvent) {
    match event {
        LedgerEvent::Transfer { from, to, amount } => {
            println!("transfer {from} -> {to}: {amount}")
        }
        LedgerEvent::Approval {
            owner,
            spender,
            amount,
        } => println!("approval {owner} -> {spender}: {amount}"),
    }
}

//==================== commands ====================//

fn init_cmd(state: &Path, supply: Amount, creator: Address, force: bool) -> anyhow::Result<()> {
    let ledger = Ledger::new(supply, creator);
    if force {
        store::save(state, &ledger)?;
    } else {
        store::create(state, &ledger)?;
    }
    info!(path = %state.display(), supply, %creator, "ledger initialised");
    println!("ledger created → {}", state.display());
    Ok(())
}

fn call_cmd(state: &Path, caller: Address, call: LedgerCall) -> anyhow::Result<()> {
    let event = store::update(state, |ledger| ledger.execute(caller, &call))?;
    print_event(&event);
    Ok(())
}

fn apply_cmd(state: &Path, batch_path: &Path) -> anyhow::Result<()> {
    let bytes =
        fs::read(batch_path).with_context(|| format!("read {}", batch_path.display()))?;
    let batch: CallBatch = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse batch {}", batch_path.display()))?;
    let events = store::update(state, |ledger| ledger.apply_batch(&batch))?;
    for event in &events {
        print_event(event);
    }
    println!("batch {} applied ({} calls)", hex::encode(batch.id()), events.len());
    Ok(())
}

fn snapshot_cmd(state: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let ledger = load(state)?;
    let json = serde_json::to_vec_pretty(&ledger.snapshot())?;
    match out {
        Some(path) => {
            write_all(path, &json)?;
            println!("snapshot written → {}", path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&json)),
    }
    Ok(())
}

fn verify_cmd(state: &Path) -> anyhow::Result<()> {
    // `load` already rejects a bad root or a broken supply sum.
    let ledger = load(state)?;
    println!(
        "ok: supply {} across {} accounts, height {}, root {}",
        ledger.total_supply(),
        ledger.accounts().count(),
        ledger.meta.height,
        hex::encode(ledger.merkle_root())
    );
    Ok(())
}

fn keygen_cmd(out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;

    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();
    let address = Address::from_verifying_key(&pk);

    write_secret(&out_dir.join("sk.hex"), hex::encode(sk_bytes).as_bytes())?;
    write_all(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes())?;
    write_all(&out_dir.join("address"), address.to_string().as_bytes())?;
    println!("keypair written → {}", out_dir.display());
    println!("address: {address}");
    Ok(())
}

//==================== main ====================//

fn run(cli: Cli) -> anyhow::Result<()> {
    let state = cli.state.as_path();
    match cli.command {
        Commands::Init {
            supply,
            creator,
            force,
        } => init_cmd(state, supply, creator, force),
        Commands::Supply => {
            println!("{}", load(state)?.total_supply());
            Ok(())
        }
        Commands::Balance { account } => {
            println!("{}", load(state)?.balance_of(&account));
            Ok(())
        }
        Commands::Allowance { owner, spender } => {
            println!("{}", load(state)?.allowance(&owner, &spender));
            Ok(())
        }
        Commands::Approve {
            caller,
            spender,
            amount,
        } => call_cmd(state, caller, LedgerCall::Approve { spender, amount }),
        Commands::Transfer { caller, to, amount } => {
            call_cmd(state, caller, LedgerCall::Transfer { to, amount })
        }
        Commands::TransferFrom {
            caller,
            from,
            to,
            amount,
        } => call_cmd(state, caller, LedgerCall::TransferFrom { from, to, amount }),
        Commands::Apply { batch } => apply_cmd(state, &batch),
        Commands::Snapshot { out } => snapshot_cmd(state, out.as_deref()),
        Commands::Verify => verify_cmd(state),
        Commands::Keygen { out_dir } => keygen_cmd(&out_dir),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenledger=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keygen_writes_matching_address() {
        let dir = tempfile::tempdir().unwrap();
        keygen_cmd(dir.path()).unwrap();

        let pk_hex = fs::read_to_string(dir.path().join("pk.hex")).unwrap();
        let pk_bytes: [u8; 32] = hex::decode(pk_hex).unwrap().try_into().unwrap();
        let pk = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes).unwrap();
        let address: Address = fs::read_to_string(dir.path().join("address"))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(address, Address::from_verifying_key(&pk));

        let sk_hex = fs::read_to_string(dir.path().join("sk.hex")).unwrap();
        let sk_bytes: [u8; 32] = hex::decode(sk_hex).unwrap().try_into().unwrap();
        assert_eq!(SigningKey::from_bytes(&sk_bytes).verifying_key(), pk);
    }

    #[cfg(unix)]
    #[test]
    fn secret_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        keygen_cmd(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("sk.hex"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        // An existing, looser file is tightened on rewrite.
        let path = dir.path().join("old.hex");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        write_secret(&path, b"y").unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(fs::read(&path).unwrap(), b"y");
    }
}
