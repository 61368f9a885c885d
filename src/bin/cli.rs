use anyhow::{bail, Context};
use pairlink::identity::resolve_identity;
use pairlink::{
    ConnectionStatus, IdentitySource, LoopbackNetwork, PairlinkConfig, PublicIpLookup, Role,
    RoleOrchestrator, SignalContext, StaticIdentity, TransportFactory,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pairlink::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: pairlink <demo|watch|identity|config> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "demo" => cmd_demo(&args).await,
        "watch" => cmd_watch(&args).await,
        "identity" => cmd_identity().await,
        "config" => cmd_config(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

struct PairOptions {
    identity: String,
    timeout: Duration,
    json: bool,
    webrtc: bool,
}

fn parse_pair_options(args: &[String]) -> anyhow::Result<PairOptions> {
    let mut options = PairOptions {
        identity: "127.0.0.1".to_string(),
        timeout: Duration::from_secs(15),
        json: false,
        webrtc: false,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--identity" => {
                i += 1;
                options.identity = args.get(i).context("--identity needs a value")?.clone();
            }
            "--timeout" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .context("--timeout needs a value")?
                    .parse()
                    .context("--timeout must be a number of seconds")?;
                options.timeout = Duration::from_secs(secs);
            }
            "--json" => options.json = true,
            "--webrtc" => options.webrtc = true,
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }
    Ok(options)
}

fn transport_factory(options: &PairOptions, config: &PairlinkConfig) -> anyhow::Result<Arc<dyn TransportFactory>> {
    if options.webrtc {
        #[cfg(feature = "webrtc")]
        return Ok(Arc::new(pairlink::transport::webrtc::WebRtcFactory::from_config(
            &config.transport,
        )));
        #[cfg(not(feature = "webrtc"))]
        bail!("pairlink was built without the `webrtc` feature");
    }
    let _ = config;
    Ok(Arc::new(LoopbackNetwork::new()))
}

/// A navigator and an interface sharing one in-memory store.
fn spawn_pair(options: &PairOptions) -> anyhow::Result<(Arc<RoleOrchestrator>, Arc<RoleOrchestrator>)> {
    let config = PairlinkConfig::load_or_default();
    let factory = transport_factory(options, &config)?;
    let ctx = SignalContext::new(Arc::new(pairlink::MemoryStore::new()), config);
    let identity: Arc<dyn IdentitySource> = Arc::new(StaticIdentity::new(options.identity.clone()));

    let navigator = RoleOrchestrator::new(
        ctx.clone(),
        Role::Navigator,
        &pairlink::records::generate_peer_id(Role::Navigator),
        identity.clone(),
        factory.clone(),
    );
    let interface = RoleOrchestrator::new(
        ctx,
        Role::Interface,
        &pairlink::records::generate_peer_id(Role::Interface),
        identity,
        factory,
    );
    interface.start();
    navigator.start();
    Ok((navigator, interface))
}

fn print_status(status: &ConnectionStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
    } else {
        println!(
            "{:<9} {:<32} {:<12} session={} remote={}",
            status.role,
            status.peer_id,
            status.state,
            status.session_id.as_deref().unwrap_or("-"),
            status.remote_peer_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_demo(args: &[String]) -> anyhow::Result<()> {
    let options = parse_pair_options(args)?;
    let (navigator, interface) = spawn_pair(&options)?;

    let connected = tokio::time::timeout(options.timeout, async {
        loop {
            if navigator.current_status().connected && interface.current_status().connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .is_ok();

    print_status(&navigator.current_status(), options.json)?;
    print_status(&interface.current_status(), options.json)?;

    navigator.shutdown().await;
    interface.shutdown().await;

    if !connected {
        bail!("peers did not connect within {:?}", options.timeout);
    }
    Ok(())
}

async fn cmd_watch(args: &[String]) -> anyhow::Result<()> {
    let options = parse_pair_options(args)?;
    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let (navigator, interface) = spawn_pair(&options)?;
    let mut nav_updates = navigator.observe_connection();
    let mut if_updates = interface.observe_connection();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            Some(_) = nav_updates.recv() => print_status(&navigator.current_status(), options.json)?,
            Some(_) = if_updates.recv() => print_status(&interface.current_status(), options.json)?,
        }
    }

    println!("Shutting down...");
    navigator.shutdown().await;
    interface.shutdown().await;
    Ok(())
}

async fn cmd_identity() -> anyhow::Result<()> {
    let config = PairlinkConfig::load_or_default();
    let lookup = PublicIpLookup::from_config(&config.identity);
    println!("{}", resolve_identity(&lookup, &config.identity.fallback).await);
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let path = args
        .get(2)
        .map(Into::into)
        .unwrap_or_else(PairlinkConfig::default_path);
    let config = PairlinkConfig::load_from_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    print!("{}", config.to_toml()?);
    Ok(())
}
