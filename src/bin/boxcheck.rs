//! `boxcheck` — the offline consistency-checker CLI (spec.md §6, §4.7):
//!
//!   boxcheck <disc-set> <acct> [--fix] [--quiet]
//!
//! Exit codes: `0` clean, `1` errors found and fixed, `2` errors present
//! and not fixed (no `--fix`), `3` unable to lock the account, `4` usage
//! error.

use clap::Parser;
use coldvault::account::AccountState;
use coldvault::checker::{CheckOptions, Checker};
use coldvault::config::Config;
use coldvault::session::lock::AccountLock;
use coldvault::ons::ObjectNamespace;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "boxcheck")]
#[command(about = "Verify and repair a coldvault account's on-disk store")]
struct Args {
    /// Path to the TOML config file naming disc sets and accounts.
    #[arg(long, default_value = "coldvault.toml")]
    config: std::path::PathBuf,

    /// Disc-set id (index into the config's `disc_sets` list).
    disc_set: usize,

    /// Account id to check.
    account: u64,

    /// Actually write repairs; without this the checker only reports.
    #[arg(long)]
    fix: bool,

    /// Suppress the per-phase summary, printing only the final line.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config_text = match std::fs::read_to_string(&args.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("boxcheck: cannot read {}: {e}", args.config.display());
            return ExitCode::from(4);
        }
    };
    let config = match Config::from_toml_str(&config_text) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("boxcheck: invalid config: {e}");
            return ExitCode::from(4);
        }
    };
    let Some(disc_set) = config.disc_set(args.disc_set).cloned() else {
        eprintln!("boxcheck: no disc set {}", args.disc_set);
        return ExitCode::from(4);
    };
    let Some(account_cfg) = config.account(args.account) else {
        eprintln!("boxcheck: no account {}", args.account);
        return ExitCode::from(4);
    };
    let account_root = account_cfg.root.clone();

    let ns = match ObjectNamespace::new(config.segment_length_bits) {
        Ok(ns) => ns,
        Err(e) => {
            eprintln!("boxcheck: bad segment length: {e:?}");
            return ExitCode::from(4);
        }
    };
    let lock_path = ns.write_lock_path(disc_set.disc(0), &account_root);
    let _lock = match AccountLock::try_acquire_now(&lock_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            eprintln!("boxcheck: account is in use, could not acquire the write lock");
            return ExitCode::from(3);
        }
        Err(e) => {
            eprintln!("boxcheck: failed to acquire lock: {e}");
            return ExitCode::from(3);
        }
    };

    let info_path = disc_set.disc(0).join(format!("{account_root}info"));
    let account = match std::fs::read(&info_path) {
        Ok(bytes) => match AccountState::read_from(&mut &bytes[..]) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("boxcheck: account info is corrupt: {e:?}");
                AccountState::new(args.account, config.default_soft_quota, config.default_hard_quota)
            }
        },
        Err(_) => AccountState::new(args.account, config.default_soft_quota, config.default_hard_quota),
    };

    let disc0 = disc_set.disc(0).to_path_buf();
    let options = CheckOptions { fix: args.fix };
    let (report, fixed_account) = match Checker::run(&config, disc_set, account_root.clone(), account, options) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("boxcheck: check failed: {e:?}");
            return ExitCode::from(3);
        }
    };

    if !args.quiet {
        println!("objects scanned:     {}", report.objects_scanned);
        println!("errors found:        {}", report.errors_found);
        println!("orphans reattached:  {}", report.orphans_reattached);
        println!("lost+found created:  {}", report.lost_and_found_created);
    }

    if args.fix {
        let info_path = disc0.join(format!("{account_root}info"));
        if let Some(parent) = info_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut out = Vec::new();
        if fixed_account.write_to(&mut out).is_ok() {
            let _ = std::fs::write(&info_path, &out);
        }
    }

    if report.errors_found == 0 {
        ExitCode::from(0)
    } else if args.fix {
        ExitCode::from(1)
    } else {
        ExitCode::from(2)
    }
}
