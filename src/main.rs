use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use crowdfund_core::{
    derive::days_left,
    memory::StoreError,
    record::{normalize_address, short_address},
    units::{format_display, parse_display},
    BackerPledge, CampaignDraft, CampaignRecord, CampaignRepository, CampaignView, ClientConfig,
    ClientError, Clock, ConfigError, DiscoveryIndex, HttpSuggestProxy, LedgerClient,
    MemoryLedger, Session, Signer, StatusFilter, SuggestionClient, SuggestionRequest,
    SystemClock, TransactionOrchestrator, TxError, TxReceipt, WalletSigner,
};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Usage(String),
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(
    name = "crowdfund",
    version,
    about = "Crowdfund campaign client over a local development ledger"
)]
struct Cli {
    /// JSON client configuration (defaults apply when omitted).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Development ledger state file.
    #[arg(long, global = true, default_value = "crowdfund.state.json")]
    state: PathBuf,

    /// Wallet secret key file (`sk.hex` from `keygen`).
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Read-only identity used for permissions when no key is given.
    #[arg(long, global = true)]
    viewer: Option<String>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a wallet keypair into a directory.
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Create an empty ledger state file.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Mint development funds into an account.
    Fund {
        /// Recipient; defaults to the wallet from --key.
        #[arg(long)]
        to: Option<String>,
        /// Amount in APT.
        #[arg(long)]
        amount: String,
    },
    /// Move the ledger clock forward.
    Warp {
        #[arg(long, default_value_t = 0)]
        days: u64,
        #[arg(long, default_value_t = 0)]
        secs: u64,
    },
    /// Start a campaign.
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Goal in APT (at least 0.01).
        #[arg(long)]
        goal: String,
        #[arg(long)]
        days: u64,
        /// Ask the suggestion proxy for a description when none is given.
        #[arg(long)]
        suggest: bool,
    },
    /// List campaigns, optionally filtered by status and paged.
    List {
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        #[arg(long)]
        start: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Show one campaign with the viewer's permissions.
    Show { address: String },
    /// Pledge an APT amount.
    Pledge { address: String, amount: String },
    /// Claim the funds of successful campaigns you created.
    Claim { address: String },
    /// Take back a pledge from a failed campaign.
    Refund { address: String },
    /// Ask the suggestion proxy for a campaign description.
    Suggest {
        #[arg(long)]
        title: String,
        #[arg(long)]
        goal: Option<String>,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> CliError {
    CliError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn load_config(path: Option<&Path>) -> CliResult<ClientConfig> {
    match path {
        Some(path) => Ok(ClientConfig::load(path)?),
        None => {
            let mut config = ClientConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn load_wallet(path: &Path) -> CliResult<WalletSigner> {
    let secret = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    Ok(WalletSigner::from_secret_hex(&secret)?)
}

/// Everything a command needs: config, the ledger, who is acting.
struct Context {
    config: ClientConfig,
    state_path: PathBuf,
    ledger: Arc<MemoryLedger>,
    repository: Arc<CampaignRepository>,
    session: Session,
    json: bool,
}

impl Context {
    fn open(cli: &Cli) -> CliResult<Self> {
        let config = load_config(cli.config.as_deref())?;
        if !cli.state.exists() {
            return Err(CliError::Usage(format!(
                "no ledger state at {}; run `crowdfund init` first",
                cli.state.display()
            )));
        }
        let ledger = Arc::new(MemoryLedger::load(
            &cli.state,
            &config,
            Arc::new(SystemClock),
        )?);
        let session = match (&cli.key, &cli.viewer) {
            (Some(key), _) => Session::connected(Arc::new(load_wallet(key)?)),
            (None, Some(viewer)) => Session::watching(viewer)?,
            (None, None) => Session::disconnected(),
        };
        let client = LedgerClient::new(ledger.clone(), config.clone());
        Ok(Self {
            config,
            state_path: cli.state.clone(),
            repository: Arc::new(CampaignRepository::new(client)),
            ledger,
            session,
            json: cli.json,
        })
    }

    fn orchestrator(&self) -> TransactionOrchestrator {
        TransactionOrchestrator::new(self.repository.clone(), self.ledger.clone())
    }

    fn save(&self) -> CliResult<()> {
        Ok(self.ledger.save(&self.state_path)?)
    }

    fn now(&self) -> u64 {
        self.ledger.now()
    }

    fn pledge_of(&self, campaign: &str) -> BackerPledge {
        self.session
            .identity()
            .map(|viewer| self.repository.get_pledge(campaign, viewer))
            .unwrap_or_default()
    }

    fn view_of(&self, record: &CampaignRecord) -> CampaignView {
        let pledge = self.pledge_of(&record.address);
        crowdfund_core::derive_view(record, self.now(), self.session.identity(), &pledge)
    }
}

fn suggestion_client(config: &ClientConfig) -> CliResult<SuggestionClient> {
    let proxy = HttpSuggestProxy::from_config(config)?
        .ok_or_else(|| CliError::Usage("no suggest_url configured".into()))?;
    Ok(SuggestionClient::new(Arc::new(proxy)).quiet(config.quiet))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("error: cannot render JSON: {err}"),
    }
}

fn apt(raw: u64) -> String {
    format!("{} APT", format_display(raw))
}

fn print_campaign(record: &CampaignRecord, view: &CampaignView, now: u64) {
    let title = if record.metadata.title.is_empty() {
        "(untitled)"
    } else {
        record.metadata.title.as_str()
    };
    println!("{title}  [{}]", view.status);
    println!("  address    {}", record.address);
    println!("  creator    {}", short_address(&record.creator));
    println!(
        "  raised     {} of {} ({:.1}%)",
        apt(record.total_raised),
        apt(record.goal),
        view.progress_percent
    );
    println!("  escrow     {}", apt(record.escrow_balance));
    if record.total_refunded > 0 {
        println!("  refunded   {}", apt(record.total_refunded));
    }
    println!("  days left  {}", days_left(record, now));
    if record.funds_claimed {
        println!("  funds claimed");
    }
    if !record.metadata.description.is_empty() {
        println!("  {}", record.metadata.description);
    }
}

fn print_receipt(ctx: &Context, verb: &str, receipt: &TxReceipt) {
    if ctx.json {
        print_json(receipt);
        return;
    }
    println!(
        "{verb} → {} (tx {}, version {})",
        short_address(&receipt.campaign),
        short_address(&receipt.hash),
        receipt.version
    );
    match &receipt.record {
        Some(record) => print_campaign(record, &ctx.view_of(record), ctx.now()),
        None => eprintln!("warn: campaign could not be re-read after the transaction"),
    }
}

fn keygen_cmd(out_dir: &Path) -> CliResult<()> {
    fs::create_dir_all(out_dir).map_err(|e| io_error(out_dir, e))?;
    let wallet = WalletSigner::generate();
    let sk_path = out_dir.join("sk.hex");
    let pk_path = out_dir.join("pk.hex");
    fs::write(&sk_path, wallet.secret_hex()).map_err(|e| io_error(&sk_path, e))?;
    fs::write(&pk_path, hex::encode(wallet.public_key())).map_err(|e| io_error(&pk_path, e))?;
    println!("keypair written → {}", out_dir.display());
    println!("address {}", wallet.address());
    Ok(())
}

fn init_cmd(cli: &Cli, force: bool) -> CliResult<()> {
    if cli.state.exists() && !force {
        return Err(CliError::Usage(format!(
            "{} already exists (use --force to reset)",
            cli.state.display()
        )));
    }
    let config = load_config(cli.config.as_deref())?;
    let ledger = MemoryLedger::new(&config);
    ledger.save(&cli.state)?;
    println!(
        "ledger initialised → {} (registry {})",
        cli.state.display(),
        short_address(ledger.registry_address())
    );
    Ok(())
}

fn fund_cmd(ctx: &Context, to: Option<&str>, amount: &str) -> CliResult<()> {
    let account = match to {
        Some(to) => normalize_address(to)?,
        None => ctx
            .session
            .signer()
            .map(|signer| signer.address().to_string())
            .ok_or_else(|| CliError::Usage("pass --to or --key".into()))?,
    };
    let raw = parse_display(amount)?;
    ctx.ledger.fund(&account, raw);
    ctx.save()?;
    println!(
        "funded {} with {} (balance {})",
        short_address(&account),
        apt(raw),
        apt(ctx.ledger.balance(&account))
    );
    Ok(())
}

fn warp_cmd(ctx: &Context, days: u64, secs: u64) -> CliResult<()> {
    let total = days.saturating_mul(SECS_PER_DAY).saturating_add(secs);
    if total == 0 {
        return Err(CliError::Usage("pass --days or --secs".into()));
    }
    ctx.ledger.warp(total);
    ctx.save()?;
    println!("ledger clock advanced by {total}s → {}", ctx.now());
    Ok(())
}

fn create_cmd(
    ctx: &Context,
    title: &str,
    description: &str,
    goal: &str,
    days: u64,
    suggest: bool,
) -> CliResult<()> {
    let mut description = description.to_string();
    if description.trim().is_empty() && suggest {
        let request = SuggestionRequest::new(title, Some(goal));
        if let Some(suggested) = suggestion_client(&ctx.config)?.suggest(&request) {
            description = suggested;
        }
    }
    let draft = CampaignDraft {
        title: title.to_string(),
        description,
        goal: parse_display(goal)?,
        duration_days: days,
    };
    let receipt = ctx.orchestrator().create(&ctx.session, &draft)?;
    ctx.save()?;
    print_receipt(ctx, "created", &receipt);
    Ok(())
}

fn list_cmd(
    ctx: &Context,
    status: StatusFilter,
    start: Option<u64>,
    limit: Option<u64>,
) -> CliResult<()> {
    let addresses = match (start, limit) {
        (None, None) => ctx.repository.list_all(),
        (start, limit) => ctx
            .repository
            .list_paged(start.unwrap_or(0), limit.unwrap_or(20)),
    };
    let index = DiscoveryIndex::new(&ctx.repository);
    let now = ctx.now();
    let rows = index.summaries(&addresses, status, now, ctx.session.identity());
    if ctx.json {
        print_json(&rows);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no {status} campaigns");
        return Ok(());
    }
    for row in &rows {
        let title = if row.record.metadata.title.is_empty() {
            "(untitled)"
        } else {
            row.record.metadata.title.as_str()
        };
        println!(
            "{}  {:<10}  {:>6.1}%  {:>14} / {:<14}  {:>3}d  {}",
            short_address(&row.record.address),
            row.view.status,
            row.view.progress_bar_percent(),
            apt(row.record.total_raised),
            apt(row.record.goal),
            row.view.days_left,
            title
        );
    }
    println!(
        "{} shown, {} in registry",
        rows.len(),
        ctx.repository.total_campaigns()
    );
    Ok(())
}

fn show_cmd(ctx: &Context, address: &str) -> CliResult<()> {
    let address = normalize_address(address)?;
    let record = ctx.repository.try_get_campaign(&address)?;
    let view = ctx.view_of(&record);
    if ctx.json {
        print_json(&serde_json::json!({ "record": record, "view": view }));
        return Ok(());
    }
    print_campaign(&record, &view, ctx.now());
    if let Some(viewer) = ctx.session.identity() {
        let pledge = ctx.pledge_of(&address);
        if pledge.amount > 0 {
            println!(
                "  your pledge {}{}",
                apt(pledge.amount),
                if pledge.refunded { " (refunded)" } else { "" }
            );
        }
        let mut actions = Vec::new();
        if view.can_pledge {
            actions.push("pledge");
        }
        if view.can_claim {
            actions.push("claim");
        }
        if view.can_refund {
            actions.push("refund");
        }
        println!(
            "  {} may: {}",
            short_address(viewer),
            if actions.is_empty() {
                "nothing".to_string()
            } else {
                actions.join(", ")
            }
        );
    }
    Ok(())
}

fn pledge_cmd(ctx: &Context, address: &str, amount: &str) -> CliResult<()> {
    let address = normalize_address(address)?;
    let raw = parse_display(amount)?;
    let receipt = ctx.orchestrator().pledge_raw(&ctx.session, &address, raw)?;
    ctx.save()?;
    print_receipt(ctx, &format!("pledged {}", apt(raw)), &receipt);
    Ok(())
}

fn claim_cmd(ctx: &Context, address: &str) -> CliResult<()> {
    let address = normalize_address(address)?;
    let receipt = ctx.orchestrator().claim(&ctx.session, &address)?;
    ctx.save()?;
    print_receipt(ctx, "claimed", &receipt);
    Ok(())
}

fn refund_cmd(ctx: &Context, address: &str) -> CliResult<()> {
    let address = normalize_address(address)?;
    let receipt = ctx.orchestrator().refund(&ctx.session, &address)?;
    ctx.save()?;
    print_receipt(ctx, "refunded", &receipt);
    Ok(())
}

fn suggest_cmd(cli: &Cli, title: &str, goal: Option<&str>) -> CliResult<()> {
    let config = load_config(cli.config.as_deref())?;
    match suggestion_client(&config)?.try_suggest(&SuggestionRequest::new(title, goal)) {
        Ok(description) => println!("{description}"),
        // soft failure: nothing to apply
        Err(err) => eprintln!("warn: no suggestion: {err}"),
    }
    Ok(())
}

fn run(cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Command::Keygen { out_dir } => keygen_cmd(out_dir),
        Command::Init { force } => init_cmd(cli, *force),
        Command::Suggest { title, goal } => suggest_cmd(cli, title, goal.as_deref()),
        Command::Fund { to, amount } => fund_cmd(&Context::open(cli)?, to.as_deref(), amount),
        Command::Warp { days, secs } => warp_cmd(&Context::open(cli)?, *days, *secs),
        Command::Create {
            title,
            description,
            goal,
            days,
            suggest,
        } => create_cmd(&Context::open(cli)?, title, description, goal, *days, *suggest),
        Command::List {
            status,
            start,
            limit,
        } => list_cmd(&Context::open(cli)?, *status, *start, *limit),
        Command::Show { address } => show_cmd(&Context::open(cli)?, address),
        Command::Pledge { address, amount } => pledge_cmd(&Context::open(cli)?, address, amount),
        Command::Claim { address } => claim_cmd(&Context::open(cli)?, address),
        Command::Refund { address } => refund_cmd(&Context::open(cli)?, address),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}
