use std::path::PathBuf;

use clap::Parser;
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

use endgame_trainer_lib::{
    AggregatedEvaluation, EvaluationView, SubmitOutcome, Trainer, TrainerConfig, TrainerResult,
};

const DEFAULT_FEN: &str = "4k3/8/4K3/4P3/8/8/8/8 w - - 0 1";

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Starting position
    #[arg(long, default_value = DEFAULT_FEN)]
    fen: String,
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// UCI engine binary, overrides the configuration
    #[arg(long)]
    engine: Option<PathBuf>,
    /// Tablebase server, overrides the configuration
    #[arg(long)]
    tablebase_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Move(String),
    Undo,
    Goto(Option<usize>),
    Reset,
    TakeBack,
    Restart,
    Accept,
    Eval,
    History,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some("undo") => Command::Undo,
        Some("goto") => match words.next() {
            Some("start") => Command::Goto(None),
            Some(ply) => Command::Goto(Some(
                ply.parse().map_err(|_| format!("not a ply number: {}", ply))?,
            )),
            None => return Err("usage: goto <ply|start>".to_string()),
        },
        Some("reset") => Command::Reset,
        Some("takeback") => Command::TakeBack,
        Some("restart") => Command::Restart,
        Some("accept") => Command::Accept,
        Some("eval") => Command::Eval,
        Some("history") => Command::History,
        Some("quit") | Some("exit") => Command::Quit,
        Some(uci) => Command::Move(uci.to_string()),
        None => return Err("empty command".to_string()),
    };
    Ok(command)
}

fn describe_evaluation(evaluation: Option<&AggregatedEvaluation>) -> String {
    let Some(evaluation) = evaluation else {
        return "no position".to_string();
    };
    let flag = if evaluation.has_error() { " (tablebase error)" } else { "" };
    match evaluation.best() {
        EvaluationView::Tablebase(result) => format!(
            "tablebase: {} (wdl {}, dtm {})",
            result.category,
            result.wdl,
            result.dtm.map_or("-".to_string(), |d| d.to_string())
        ),
        EvaluationView::Engine(engine) => match engine.mate_in_moves {
            Some(mate) => format!("engine: mate {} at depth {}{}", mate, engine.depth, flag),
            None => format!(
                "engine: {:+.2} at depth {}{}",
                engine.score_centipawns as f64 / 100.0,
                engine.depth,
                flag
            ),
        },
        EvaluationView::Pending => "evaluating...".to_string(),
        EvaluationView::Unavailable => format!("no evaluation available{}", flag),
    }
}

async fn run_command(trainer: &Trainer, command: Command) -> bool {
    let controller = &trainer.controller;
    match command {
        Command::Move(uci) => match controller.submit_move(&uci).await {
            SubmitOutcome::Committed { ply, verdict } => match verdict {
                Some(verdict) => println!(
                    "{}. {}{} {}",
                    ply + 1,
                    uci,
                    verdict.symbol_class.symbol(),
                    verdict.rationale
                ),
                None => println!("{}. {} (no verdict)", ply + 1, uci),
            },
            SubmitOutcome::Intercepted(interception) => {
                println!(
                    "{}{} changes the result ({} -> {}): {}",
                    interception.rejected_move,
                    interception.verdict.symbol_class.symbol(),
                    interception.wdl_before,
                    interception.wdl_after,
                    interception.verdict.rationale
                );
                if let Some(best) = &interception.best_alternative_move {
                    println!("best was {}", best.san);
                }
                println!("takeback | restart | accept");
            }
            SubmitOutcome::Illegal(reason) => println!("illegal: {}", reason),
            SubmitOutcome::Busy => println!("busy, resolve the pending move first"),
            SubmitOutcome::Superseded => println!("position changed, move discarded"),
        },
        Command::Undo => match controller.undo().await {
            Some(mv) => println!("undid {}", mv),
            None => println!("nothing to undo"),
        },
        Command::Goto(index) => {
            if let Err(e) = controller.go_to_move(index).await {
                println!("{}", e);
            }
        }
        Command::Reset => controller.reset().await,
        Command::TakeBack => match controller.take_back().await {
            Ok(mv) => println!("took back {}", mv),
            Err(e) => println!("{}", e),
        },
        Command::Restart => {
            if let Err(e) = controller.restart().await {
                println!("{}", e);
            }
        }
        Command::Accept => match controller.accept_anyway().await {
            Ok(ply) => println!("accepted as ply {}", ply + 1),
            Err(e) => println!("{}", e),
        },
        Command::Eval => println!("{}", describe_evaluation(controller.evaluation().as_ref())),
        Command::History => {
            let session = controller.snapshot().await;
            for (ply, entry) in session.move_history.iter().enumerate() {
                let marker = if session.current_move_index == Some(ply) { "*" } else { " " };
                let symbol = entry.verdict.as_ref().map_or("", |v| v.symbol_class.symbol());
                println!("{}{:>3}. {}{}", marker, ply + 1, entry.played, symbol);
            }
            if session.current_move_index.is_none() {
                println!("* at start: {}", session.initial_position);
            }
        }
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> TrainerResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrainerConfig::load(path)?,
        None => TrainerConfig::default(),
    };
    if let Some(engine) = cli.engine {
        config.engine.path = Some(engine);
    }
    if let Some(url) = cli.tablebase_url {
        config.tablebase.base_url = url;
    }

    let trainer = Trainer::start(&config, &cli.fen).await?;
    info!("Ready. Enter UCI moves or commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => {
                if !run_command(&trainer, command).await {
                    break;
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    trainer.shutdown().await;
    Ok(())
}
