mod scripted;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::rc::Rc;
use std::time::Duration;

use authsync::clock::ManualClock;
use authsync::{
    AuthConfig, AuthError, AuthState, Clock, Coordinator, CoordinatorDeps, Credentials, MemoryBackend, MemoryBus,
    SignInOptions, SignOutOptions, SystemClock,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use crate::scripted::ScriptedRemote;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] AuthError),
    #[error("failed to open input {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("failed to read input: {0}")]
    Read(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("--tabs must be at least {min}")]
    TooFewTabs { min: usize },
}

#[derive(Parser, Debug)]
#[command(name = "authsync-cli", about = "Simulate browser tabs sharing auth state")]
struct Cli {
    #[arg(long, env = "AUTHSYNC_PROJECT_ID", default_value = "demo-project")]
    project_id: String,

    #[arg(long, env = "AUTHSYNC_PUBLISHABLE_KEY", default_value = "pk_test_demo")]
    publishable_key: String,

    #[arg(long, env = "AUTHSYNC_PREFIX", default_value = authsync::config::DEFAULT_PREFIX)]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in on one tab, sign out on another, print every tab after each step.
    Scenario(ScenarioArgs),
    /// Sign out while a slow refresh is in flight.
    Race(RaceArgs),
    /// Repeat status checks and report validation cache statistics.
    Cache(CacheArgs),
    /// Decode sync messages, one JSON object per line.
    Decode(DecodeArgs),
}

#[derive(Args, Debug)]
struct ScenarioArgs {
    #[arg(long, default_value_t = 2)]
    tabs: usize,

    #[arg(long, default_value = "demo@example.com")]
    email: String,

    #[arg(long, default_value_t = false, help = "Make the remote sign-out call fail")]
    fail_sign_out: bool,

    #[arg(long, default_value_t = false, help = "Drop every sync message")]
    lossy: bool,
}

#[derive(Args, Debug)]
struct RaceArgs {
    #[arg(long, default_value_t = 500)]
    refresh_delay_ms: u64,

    #[arg(long, default_value_t = 100)]
    sign_out_after_ms: u64,
}

#[derive(Args, Debug)]
struct CacheArgs {
    #[arg(long, default_value_t = 3)]
    checks: usize,

    #[arg(long, default_value_t = 0, help = "Simulated seconds between checks")]
    advance_secs: u64,

    #[arg(long, default_value_t = false)]
    fail_validation: bool,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,
}

/// Tabs of one simulated origin: shared storage, bus, clock and remote.
struct Origin {
    config: AuthConfig,
    clock: Rc<ManualClock>,
    bus: MemoryBus,
    backend: MemoryBackend,
    remote: Rc<ScriptedRemote>,
}

impl Origin {
    fn new(config: AuthConfig, remote: impl FnOnce(Rc<dyn Clock>) -> ScriptedRemote) -> Self {
        let clock = Rc::new(ManualClock::new(SystemClock.now_ms()));
        let shared: Rc<dyn Clock> = clock.clone();
        let remote = Rc::new(remote(shared));
        Self { config, clock, bus: MemoryBus::new(), backend: MemoryBackend::new(), remote }
    }

    fn open_tab(&self) -> Result<Coordinator, AuthError> {
        let deps = CoordinatorDeps {
            remote: self.remote.clone(),
            backend: Box::new(self.backend.clone()),
            transports: vec![Box::new(self.bus.endpoint())],
            clock: self.clock.clone(),
        };
        Coordinator::start(self.config.clone(), deps)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = AuthConfig::for_project(Credentials::new(cli.project_id, cli.publishable_key));
    config.prefix = cli.prefix;
    config.validate()?;

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            match cli.command {
                Command::Scenario(args) => run_scenario(config, args).await,
                Command::Race(args) => run_race(config, args).await,
                Command::Cache(args) => run_cache(config, args).await,
                Command::Decode(args) => run_decode(&args),
            }
        })
        .await
}

async fn run_scenario(config: AuthConfig, args: ScenarioArgs) -> Result<(), CliError> {
    if args.tabs < 2 {
        return Err(CliError::TooFewTabs { min: 2 });
    }
    let origin = Origin::new(config, |clock| {
        let mut remote = ScriptedRemote::new(clock);
        remote.fail_sign_out = args.fail_sign_out;
        remote
    });
    origin.bus.set_dropping(args.lossy);

    let tabs = (0..args.tabs).map(|_| origin.open_tab()).collect::<Result<Vec<_>, _>>()?;
    let errors: Vec<_> = tabs
        .iter()
        .map(|tab| {
            let tab_id = tab.tab_id().to_owned();
            tab.on_error(move |err| eprintln!("tab {tab_id}: {err}"))
        })
        .collect();
    origin.bus.flush();
    print_step("opened", &tabs)?;

    let options = SignInOptions { email: Some(args.email), ..SignInOptions::default() };
    tabs[0].sign_in(Some("email"), options).await;
    origin.bus.flush();
    print_step("tab 0 signed in", &tabs)?;

    origin.clock.advance(Duration::from_secs(1));
    tabs[1].sign_out(SignOutOptions::default()).await;
    origin.bus.flush();
    print_step("tab 1 signed out", &tabs)?;

    drop(errors);
    Ok(())
}

async fn run_race(config: AuthConfig, args: RaceArgs) -> Result<(), CliError> {
    let origin = Origin::new(config, |clock| {
        let mut remote = ScriptedRemote::new(clock);
        remote.refresh_delay = Duration::from_millis(args.refresh_delay_ms);
        remote
    });
    let tab = origin.open_tab()?;
    tab.sign_in(None, SignInOptions::default()).await;

    let sign_out_after = Duration::from_millis(args.sign_out_after_ms);
    let (refreshed, signed_out) = tokio::join!(tab.refresh_session(), async {
        tokio::time::sleep(sign_out_after).await;
        tab.sign_out(SignOutOptions::default()).await
    });

    print_json(&json!({
        "refreshResult": state_json(&refreshed)?,
        "signOutResult": state_json(&signed_out)?,
        "final": state_json(&tab.state())?,
        "remoteCalls": origin.remote.calls(),
    }))
}

async fn run_cache(config: AuthConfig, args: CacheArgs) -> Result<(), CliError> {
    let origin = Origin::new(config, |clock| {
        let mut remote = ScriptedRemote::new(clock);
        remote.fail_validation = args.fail_validation;
        remote
    });
    let tab = origin.open_tab()?;

    for check in 0..args.checks {
        if check > 0 {
            origin.clock.advance(Duration::from_secs(args.advance_secs));
        }
        let state = tab.check_auth_status().await;
        let stats = tab.cache_stats();
        print_json(&json!({
            "check": check + 1,
            "error": state.error,
            "hits": stats.hits,
            "misses": stats.misses,
            "remoteCalls": stats.remote_calls,
        }))?;
    }
    Ok(())
}

fn run_decode(args: &DecodeArgs) -> Result<(), CliError> {
    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.input).map_err(|source| CliError::Open { path: args.input.clone(), source })?;
        Box::new(BufReader::new(file))
    };

    let mut decoded = 0_usize;
    let mut rejected = 0_usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match frames::decode_message(&line) {
            Ok(message) => {
                decoded = decoded.saturating_add(1);
                println!("{} {} from={} seq={} ts={}", message.id, message.kind().as_str(), message.tab_id, message.seq, message.timestamp);
            }
            Err(err) => {
                rejected = rejected.saturating_add(1);
                eprintln!("rejected: {err}");
            }
        }
    }

    eprintln!("decode complete: decoded={decoded} rejected={rejected}");
    Ok(())
}

fn print_step(label: &str, tabs: &[Coordinator]) -> Result<(), CliError> {
    let states = tabs
        .iter()
        .map(|tab| Ok(json!({ "tabId": tab.tab_id(), "state": state_json(&tab.state())? })))
        .collect::<Result<Vec<Value>, CliError>>()?;
    print_json(&json!({ "step": label, "tabs": states }))
}

fn state_json(state: &AuthState) -> Result<Value, CliError> {
    Ok(serde_json::to_value(state)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
