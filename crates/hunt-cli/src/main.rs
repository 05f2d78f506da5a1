use std::env;
use std::net::SocketAddr;

use contracts::QUALIFY_QUOTA;
use hunt_api::{default_sqlite_path, serve, ServerConfig, SqliteParticipantStore};
use hunt_core::admission::AdmissionController;
use hunt_core::assignment;

fn print_usage() {
    println!("hunt <command>");
    println!("commands:");
    println!("  serve [addr]");
    println!("    default addr: 127.0.0.1:8080");
    println!("  assign <participant_id> [page]");
    println!("    prints the deterministic link table for a participant");
    println!("  standings");
    println!("  set-round <0|1|2|3>");
    println!("  reset");
    println!("    clears every participant and deactivates the round");
    println!();
    println!("environment:");
    println!("  HUNT_SQLITE_PATH   sqlite database path (default: hunt_game.sqlite)");
    println!("  HUNT_ADMIN_TOKEN   bearer token for admin routes (unset = open dev mode)");
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn open_controller() -> Result<AdmissionController<SqliteParticipantStore>, String> {
    let path = default_sqlite_path();
    let store = SqliteParticipantStore::open(&path)
        .map_err(|err| format!("failed to open store at {path}: {err}"))?;
    Ok(AdmissionController::new(store))
}

fn print_assignments(participant_id: &str, page: Option<&String>) {
    let assignments = match page {
        Some(page) => assignment::assignments_for_page(participant_id, page),
        None => assignment::assignments_for_participant(participant_id),
    };

    println!(
        "participant={} hash={} slots={}",
        participant_id,
        assignment::stable_hash(participant_id),
        assignments.len()
    );
    for entry in &assignments {
        let marker = if entry.is_real {
            "REAL"
        } else if entry.visible {
            "decoy"
        } else {
            "hidden"
        };
        println!(
            "  {:<8} {:<10} {:<8} {:<7} {}",
            entry.page, entry.section, entry.position, marker, entry.destination
        );
    }

    match assignment::reachable_genuine_destination(participant_id) {
        Some(destination) => println!("genuine link reachable at {destination}"),
        None => println!("no reachable genuine link this session"),
    }
}

fn run_standings() -> Result<(), String> {
    let mut controller = open_controller()?;
    let roster = controller
        .roster()
        .map_err(|err| format!("failed to load roster: {err}"))?;

    println!(
        "round={} total={} qualified={}/{QUALIFY_QUOTA} playing={} failed={} disqualified={}",
        roster.round_settings.active_round,
        roster.stats.total,
        roster.stats.qualified,
        roster.stats.playing,
        roster.stats.failed,
        roster.stats.disqualified
    );
    for participant in &roster.participants {
        println!(
            "  {:<24} {:<14} {:>8}ms  {}",
            participant.display_name,
            participant.status.as_str(),
            participant.elapsed_ms,
            participant.participant_id
        );
    }
    Ok(())
}

fn run_set_round(args: &[String]) -> Result<(), String> {
    let round = args
        .get(2)
        .ok_or_else(|| "missing round number".to_string())?
        .parse::<u8>()
        .map_err(|_| "invalid round number".to_string())?;

    let mut controller = open_controller()?;
    let settings = controller
        .set_active_round(round)
        .map_err(|err| err.to_string())?;

    match settings.active_round {
        0 => println!("round deactivated"),
        n => println!("round {n} is now active"),
    }
    Ok(())
}

fn run_reset() -> Result<(), String> {
    let mut controller = open_controller()?;
    controller.reset_game().map_err(|err| err.to_string())?;
    println!("game reset; all participants cleared");
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => match parse_socket_addr(args.get(2)) {
            Ok(addr) => {
                init_tracing();
                println!("serving hunt api on http://{addr}");
                if let Err(err) = serve(addr, ServerConfig::from_env()).await {
                    eprintln!("server error: {err}");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("assign") => match args.get(2) {
            Some(participant_id) => print_assignments(participant_id, args.get(3)),
            None => {
                eprintln!("error: missing participant_id");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("standings") => {
            if let Err(err) = run_standings() {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some("set-round") => {
            if let Err(err) = run_set_round(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        Some("reset") => {
            if let Err(err) = run_reset() {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        _ => {
            print_usage();
        }
    }
}
