use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, ensure};
use chrono::Utc;
use clap::Parser;
use solana_sdk::native_token::{lamports_to_sol, sol_to_lamports};
use solana_sdk::pubkey::Pubkey;
use tracing_subscriber::EnvFilter;

use spendthrone::{
    config::ThroneConfig,
    endpoints,
    engine::ThroneService,
    interfaces::{ProfileProof, ProfileUpdate},
    leaderboard::profile_message,
    sacrifice,
    settlement::{SacrificeRequest, SettlementOutcome, SwapRequest, TransferRequest},
    wallet::{KeypairWallet, WalletSigner},
};

#[derive(Parser)]
#[command(version, about = "Pay tribute to the SpendThrone treasury", long_about = None)]
struct Cli {
    /// Path to the service configuration.
    #[arg(long, short, default_value = "configs/mainnet.yaml")]
    config: PathBuf,
    /// Keypair file, used when no keypair is set in the environment.
    #[arg(long, short)]
    keypair: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Show the resolved wallet and its standing.
    Whoami,
    /// Send SOL straight to the treasury.
    Transfer {
        /// Amount in SOL.
        #[arg(long)]
        sol: f64,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        link: Option<String>,
        /// Wallet credited with the referral.
        #[arg(long)]
        referrer: Option<Pubkey>,
    },
    /// Swap a token and route the proceeds to the treasury.
    Swap {
        /// Input token symbol or mint.
        #[arg(long)]
        input: String,
        /// Amount in the input token's display units.
        #[arg(long)]
        amount: f64,
        /// Output token symbol or mint.
        #[arg(long, default_value = "USDC")]
        output: String,
        /// Decimals of the input mint when it is not a known token.
        #[arg(long)]
        decimals: Option<u8>,
        #[arg(long)]
        slippage_bps: Option<u16>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        link: Option<String>,
    },
    /// Close empty token accounts and send the rent to the treasury.
    Sacrifice {
        /// Only list what would be closed.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        message: Option<String>,
    },
    /// Replay deposits held in the local ledger.
    Reconcile,
    /// Sign and submit a profile update for the resolved wallet.
    Profile {
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        link: Option<String>,
    },
    /// Zero a wallet's leaderboard total and count.
    Reset {
        #[arg(long)]
        wallet: Pubkey,
        /// Required to confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_mint(token: &str) -> Result<Pubkey> {
    let mint = endpoints::mint_for_symbol(token).unwrap_or(token);
    Pubkey::from_str(mint).map_err(|_| anyhow!("unknown token {token}"))
}

fn print_outcome(outcome: &SettlementOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if !outcome.record.recorded {
        eprintln!("settled on-chain; leaderboard update is pending local reconciliation");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ThroneConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(config.monitoring.log_level.as_str());
    let batch_limit = config.sacrifice.batch_limit;
    let service = ThroneService::new(config)?;
    service.start();
    let result = run(&cli, &service, batch_limit).await;
    service.stop();
    result
}

async fn run(cli: &Cli, service: &ThroneService, batch_limit: usize) -> Result<()> {
    match &cli.command {
        Command::Reconcile => {
            let report = service.recorder().reconcile().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Command::Reset { wallet, yes } => {
            ensure!(*yes, "pass --yes to reset {wallet}");
            service.leaderboard().reset_entry(&wallet.to_string()).await?;
            println!("reset {wallet}");
            return Ok(());
        }
        _ => {}
    }
    let wallet = KeypairWallet::resolve(cli.keypair.as_deref())?;
    let owner = wallet.pubkey();
    tracing::info!(wallet = %owner, source = wallet.source(), "wallet resolved");
    let executor = service.executor();
    match &cli.command {
        Command::Whoami => {
            let standing = service.leaderboard().standing(&owner.to_string()).await;
            println!("{owner}");
            println!("{}", serde_json::to_string_pretty(&standing)?);
        }
        Command::Transfer {
            sol,
            message,
            link,
            referrer,
        } => {
            ensure!(sol.is_finite() && *sol > 0.0, "amount must be positive");
            let outcome = executor
                .transfer(
                    &wallet,
                    TransferRequest {
                        lamports: sol_to_lamports(*sol),
                        message: message.clone(),
                        link: link.clone(),
                        referrer: *referrer,
                    },
                )
                .await?;
            print_outcome(&outcome)?;
        }
        Command::Swap {
            input,
            amount,
            output,
            decimals,
            slippage_bps,
            message,
            link,
        } => {
            ensure!(amount.is_finite() && *amount > 0.0, "amount must be positive");
            let input_mint = resolve_mint(input)?;
            let output_mint = resolve_mint(output)?;
            let input_decimals = decimals
                .or_else(|| endpoints::decimals_for_mint(&input_mint.to_string()))
                .ok_or_else(|| anyhow!("pass --decimals for {input}"))?;
            let base_units = (amount * 10f64.powi(i32::from(input_decimals))).round() as u64;
            let outcome = executor
                .swap(
                    &wallet,
                    SwapRequest {
                        input_mint,
                        input_decimals,
                        output_mint,
                        amount: base_units,
                        slippage_bps: *slippage_bps,
                        message: message.clone(),
                        link: link.clone(),
                    },
                )
                .await?;
            print_outcome(&outcome)?;
        }
        Command::Sacrifice { dry_run, message } => {
            if *dry_run {
                let candidates = sacrifice::scan(service.rpc().as_ref(), &owner).await?;
                let summary = sacrifice::summarize(&candidates);
                let plan = sacrifice::plan(&candidates, batch_limit);
                println!(
                    "{} empty accounts, {} SOL reclaimable; next batch closes {} for {} SOL",
                    summary.candidates,
                    lamports_to_sol(summary.reclaimable_lamports),
                    plan.selected.len(),
                    lamports_to_sol(plan.total_reclaimed),
                );
                return Ok(());
            }
            let outcome = executor
                .sacrifice(
                    &wallet,
                    SacrificeRequest {
                        message: message.clone(),
                        link: None,
                    },
                )
                .await?;
            print_outcome(&outcome)?;
        }
        Command::Profile {
            display_name,
            message,
            link,
        } => {
            let address = owner.to_string();
            let statement = profile_message(&address, Utc::now().timestamp());
            let proof = ProfileProof {
                signature: wallet.sign_message(statement.as_bytes()).to_string(),
                message: statement,
            };
            let update = ProfileUpdate {
                display_name: display_name.clone(),
                message: message.clone(),
                link: link.clone(),
                ..ProfileUpdate::default()
            };
            let outcome = service
                .leaderboard()
                .update_profile(&address, &update, &proof)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Reconcile | Command::Reset { .. } => {}
    }
    Ok(())
}
