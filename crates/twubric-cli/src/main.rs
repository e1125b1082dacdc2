use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use twubric_core::{BoardState, DateRange, RecordId, SortKey};
use twubric_pipeline::{Board, BoardConfig};

#[derive(Debug, Parser)]
#[command(name = "twubric")]
#[command(about = "Twubric board command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, Args)]
struct ViewArgs {
    /// Sub-score to sort by: total, friends, influence or chirpiness.
    #[arg(long)]
    sort: Option<SortKey>,
    /// Earliest join date, inclusive. Ignored unless --to is also given.
    #[arg(long, value_name = "YYYY-MM-DD")]
    from: Option<NaiveDate>,
    /// Latest join date, inclusive. Ignored unless --from is also given.
    #[arg(long, value_name = "YYYY-MM-DD")]
    to: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the board, loading from the snapshot or the feed.
    Show(ViewArgs),
    /// Delete one record from the displayed board and persist the result.
    Delete {
        id: String,
        #[command(flatten)]
        view: ViewArgs,
    },
    /// Fetch the feed once this run (unless bootstrap already did) and overwrite the snapshot.
    Refresh(ViewArgs),
    /// Serve the board over HTTP.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Show(ViewArgs::default()));

    let state = match command {
        Commands::Serve => return twubric_web::serve_from_env().await,
        Commands::Show(view) => {
            let board = open_board().await?;
            apply_view(&board, &view).await
        }
        Commands::Delete { id, view } => {
            let board = open_board().await?;
            let state = apply_view(&board, &view).await;
            let id = state.resolve_id(&id).unwrap_or(RecordId::Text(id));
            board.request_delete(&id).await
        }
        Commands::Refresh(view) => {
            let board = Board::from_config(&BoardConfig::from_env())?;
            board.refresh().await;
            apply_view(&board, &view).await
        }
    };

    print_board(&state);
    Ok(())
}

async fn open_board() -> Result<Board> {
    let board = Board::from_config(&BoardConfig::from_env())?;
    board.bootstrap().await;
    Ok(board)
}

async fn apply_view(board: &Board, view: &ViewArgs) -> std::sync::Arc<BoardState> {
    let mut state = board.current().await;
    if view.from.is_some() || view.to.is_some() {
        state = board
            .change_date_range(DateRange::new(view.from, view.to))
            .await;
    }
    if let Some(key) = view.sort {
        state = board.select_sort_key(key).await;
    }
    state
}

fn print_board(state: &BoardState) {
    if let Some(reason) = state.failure() {
        eprintln!("feed unavailable: {reason}");
    }
    println!(
        "{:<8} {:<20} {:>7} {:>8} {:>10} {:>11}  JOINED",
        "UID", "USERNAME", "TOTAL", "FRIENDS", "INFLUENCE", "CHIRPINESS"
    );
    for record in state.displayed() {
        println!(
            "{:<8} {:<20} {:>7} {:>8} {:>10} {:>11}  {}",
            record.id.to_string(),
            record.display_name,
            record.scores.total,
            record.scores.friends,
            record.scores.influence,
            record.scores.chirpiness,
            record.join_date_label()
        );
    }
    println!("{} record(s)", state.displayed().len());
}
