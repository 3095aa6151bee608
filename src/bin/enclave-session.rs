//! Enclave Session CLI — exercise attestation against a simulated enclave
//!
//! Commands:
//!   enclave-session params  — generate and print attestation parameters
//!   enclave-session attest  — attest and establish a session
//!   enclave-session demo    — walk through caching, coalescing and invalidation

use enclave_session::{
    AttestationProtocol, EnclaveProvider, ProviderConfig, SimulatedEnclave,
};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_SERVER: &str = "sql.example.com";
const DEFAULT_URL: &str = "https://attest.example.com/enclave";

fn print_usage() {
    println!(
        r#"
Enclave Session — client-side enclave attestation

Usage: enclave-session [--config <file>] <command> [options]

Commands:
  params  <protocol>                  Generate attestation parameters
  attest  <protocol> [server] [url]   Attest a simulated enclave and establish a session
  demo                                Run the full session lifecycle demo
  help                                Show this message

Protocols: authority-token (aas), host-health (hgs), none

Examples:
  enclave-session params host-health
  enclave-session attest authority-token sql.example.com https://attest.example.com/enclave
  enclave-session --config provider.json demo
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = args.remove(i + 1);
            args.remove(i);
            Some(path)
        }
        Some(_) => {
            eprintln!("--config needs a file path");
            return;
        }
        None => None,
    };

    let Some(command) = args.first() else {
        print_usage();
        return;
    };

    match command.as_str() {
        "params" => cmd_params(&args[1..]),
        "attest" => cmd_attest(&args[1..], config_path.as_deref()).await,
        "demo" => cmd_demo(config_path.as_deref()).await,
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }
}

fn parse_protocol(arg: Option<&String>) -> Option<AttestationProtocol> {
    let Some(arg) = arg else {
        eprintln!("  Missing protocol");
        return None;
    };
    match arg.parse() {
        Ok(protocol) => Some(protocol),
        Err(e) => {
            eprintln!("  {}", e);
            None
        }
    }
}

/// Provider trusting `enclave`, with file settings layered on when given
fn build_provider(enclave: &SimulatedEnclave, config_path: Option<&str>) -> Option<EnclaveProvider> {
    let mut config = match config_path {
        Some(path) => match ProviderConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("  {}", e);
                return None;
            }
        },
        None => ProviderConfig::default(),
    };
    config.protocol = enclave.protocol();
    config.policy.trusted_authorities = enclave.policy().trusted_authorities;
    config.policy.trusted_measurements = vec![enclave.measurement().to_string()];

    match EnclaveProvider::new(&config) {
        Ok(provider) => Some(provider),
        Err(e) => {
            eprintln!("  Failed to build provider: {}", e);
            None
        }
    }
}

fn cmd_params(args: &[String]) {
    let Some(protocol) = parse_protocol(args.first()) else {
        return;
    };
    let generator = enclave_session::ParameterGenerator::default();
    match generator.generate(protocol) {
        Ok(params) => {
            println!("\n  Attestation Parameters");
            println!("  {}", "=".repeat(40));
            println!("  Protocol:    {} (tag {})", protocol, protocol.tag());
            println!("  Nonce:       {}", hex::encode(params.nonce()));
            println!("  Public key:  {}...", &hex::encode(params.client_public_key())[..32]);
            println!("  Request:     {} bytes", params.to_bytes().len());
        }
        Err(e) => eprintln!("  Failed to generate parameters: {}", e),
    }
}

async fn cmd_attest(args: &[String], config_path: Option<&str>) {
    let Some(protocol) = parse_protocol(args.first()) else {
        return;
    };
    let server = args.get(1).map(String::as_str).unwrap_or(DEFAULT_SERVER);
    let url = args.get(2).map(String::as_str).unwrap_or(DEFAULT_URL);

    let enclave = SimulatedEnclave::new(protocol, url);
    let Some(provider) = build_provider(&enclave, config_path) else {
        return;
    };

    println!("\n  Attesting {} via {} ({})...", server, url, protocol);
    let started = Instant::now();
    match provider.establish_session(server, url, &enclave).await {
        Ok((session, counter)) => {
            println!("  {}", session.summary());
            println!("  Counter:     {}", counter);
            println!("  Took:        {:?}", started.elapsed());
        }
        Err(e) => eprintln!("  Attestation failed: {}", e),
    }
}

async fn cmd_demo(config_path: Option<&str>) {
    println!("\nEnclave Session — lifecycle demo\n");

    let enclave = Arc::new(
        SimulatedEnclave::new(AttestationProtocol::AuthorityToken, DEFAULT_URL)
            .with_latency(Duration::from_millis(200)),
    );
    let Some(provider) = build_provider(&enclave, config_path) else {
        return;
    };
    let provider = Arc::new(provider);

    // Step 1: nothing cached yet
    println!("Step 1: Cache lookup before attestation");
    println!("{}", "-".repeat(60));
    let (cached, counter) = provider.get_enclave_session(DEFAULT_SERVER, DEFAULT_URL);
    println!("  Cached: {}, counter: {}\n", cached.is_some(), counter);

    // Step 2: concurrent callers share one attestation
    println!("Step 2: 8 concurrent callers");
    println!("{}", "-".repeat(60));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        let enclave = enclave.clone();
        tasks.push(tokio::spawn(async move {
            provider
                .establish_session(DEFAULT_SERVER, DEFAULT_URL, enclave.as_ref())
                .await
        }));
    }
    let mut established = None;
    for task in tasks {
        match task.await {
            Ok(Ok((session, _))) => established = Some(session),
            Ok(Err(e)) => eprintln!("  Caller failed: {}", e),
            Err(e) => eprintln!("  Task panicked: {}", e),
        }
    }
    let Some(session) = established else {
        return;
    };
    println!("  Exchanges with the enclave: {}", enclave.exchange_count());
    println!("  {}\n", session.summary());

    // Step 3: replay counter
    println!("Step 3: Reuse the cached session");
    println!("{}", "-".repeat(60));
    for _ in 0..3 {
        let (_, counter) = provider.get_enclave_session(DEFAULT_SERVER, DEFAULT_URL);
        println!("  Counter: {}", counter);
    }
    let agree = enclave
        .take_enclave_key(session.session_id())
        .is_some_and(|key| *key == *session.key_material());
    println!("  Client and enclave keys agree: {}\n", agree);

    // Step 4: invalidate and re-establish
    println!("Step 4: Invalidate and re-establish");
    println!("{}", "-".repeat(60));
    provider.invalidate_enclave_session(DEFAULT_SERVER, DEFAULT_URL, &session);
    match provider
        .establish_session(DEFAULT_SERVER, DEFAULT_URL, enclave.as_ref())
        .await
    {
        Ok((fresh, counter)) => {
            println!("  {}", fresh.summary());
            println!("  Counter: {}", counter);
            println!("  Exchanges with the enclave: {}", enclave.exchange_count());
        }
        Err(e) => eprintln!("  Re-establishment failed: {}", e),
    }
}
