use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kernel_proxy::{Disconnected, JupyterKernel, KernelService};
use log::{error, info};
use notebook::output::MimeType;
use notebook::{
    format, settings, Cell, CellKind, CollapseState, Document, EditorSession, Position, Severity,
};

#[derive(Parser, Debug)]
#[command(name = "notebook")]
#[command(about = "Inspect, create and run Jupyter notebooks from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the cells of a notebook
    Show { path: PathBuf },

    /// Write a new notebook with one empty code cell
    New { path: PathBuf },

    /// Run every code cell in order through a kernel
    Run {
        path: PathBuf,

        /// Kernelspec to launch (default: from settings)
        #[arg(long)]
        kernel: Option<String>,

        /// Write outputs back into the notebook
        #[arg(long)]
        in_place: bool,
    },

    /// Validate a notebook file
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Show { path } => show(&path),
        Commands::New { path } => new_notebook(&path),
        Commands::Run {
            path,
            kernel,
            in_place,
        } => run(&path, kernel, in_place).await,
        Commands::Check { path } => check(&path),
    }
}

fn show(path: &Path) -> anyhow::Result<()> {
    let document = format::load(path)?;
    print_document(&document);
    Ok(())
}

fn new_notebook(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let settings = settings::load_settings();
    let mut document = Document::new().with_id_length(settings.cell_id_length);
    document.insert(CellKind::Code, None, Position::After);
    format::save(&document, path)?;
    println!("Created {}", path.display());
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let document = format::load(path)?;
    document
        .check_invariants()
        .map_err(|e| anyhow::anyhow!("inconsistent document: {}", e))?;
    println!("{}: ok ({} cells)", path.display(), document.len());
    Ok(())
}

async fn run(path: &Path, kernel_name: Option<String>, in_place: bool) -> anyhow::Result<()> {
    let mut settings = settings::load_settings();
    if let Some(name) = kernel_name {
        settings.kernel_name = name;
    }

    let mut session = EditorSession::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .with_default_kind(settings.default_cell_kind)
        .with_id_length(settings.cell_id_length);

    let working_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    let kernel: Arc<dyn KernelService> =
        match JupyterKernel::start(settings.kernel_config(working_dir)).await {
            Ok(kernel) => {
                info!("Started kernel {}", settings.kernel_name);
                Arc::new(kernel)
            }
            Err(e) => {
                error!("Failed to start kernel {}: {}", settings.kernel_name, e);
                Arc::new(Disconnected)
            }
        };

    let (queue, mut events) = notebook::spawn_queue_processor(kernel.clone());
    session.attach_queue(queue);

    let queued = session.run_all();
    info!("Queued {} code cell(s)", queued);
    notebook::drive_until_idle(&mut session, &mut events).await;

    print_document(session.document());

    if in_place && queued > 0 {
        session.save()?;
        println!("Saved {}", path.display());
    }

    if let Err(e) = kernel.shutdown().await {
        error!("Failed to shut down kernel: {}", e);
    }

    let notices = session.take_notices();
    for notice in &notices {
        eprintln!("{:?}: {}", notice.severity, notice.message);
    }
    if notices.iter().any(|n| n.severity == Severity::Error) {
        anyhow::bail!("execution finished with errors");
    }
    Ok(())
}

fn print_document(document: &Document) {
    for (index, cell) in document.iter().enumerate() {
        print_cell(index, cell);
    }
}

fn print_cell(index: usize, cell: &Cell) {
    let count = cell
        .code()
        .and_then(|c| c.execution_count)
        .map(|n| format!(" [{}]", n))
        .unwrap_or_default();
    println!(
        "── {} {} {}{} ({})",
        index,
        cell.kind(),
        cell.id,
        count,
        cell.collapse_state()
    );

    if matches!(
        cell.collapse_state(),
        CollapseState::CodeCollapsed | CollapseState::BothCollapsed
    ) {
        println!("{}", cell.placeholder());
    } else {
        println!("{}", cell.source);
    }

    let Some(code) = cell.code() else {
        return;
    };
    if code.collapse.output {
        return;
    }
    for output in &code.outputs {
        match output.preferred_mime() {
            Some(MimeType::Png) => match output.png_bytes() {
                Some(Ok(bytes)) => println!("<image/png, {} bytes>", bytes.len()),
                _ => println!("<image/png, undecodable>"),
            },
            _ => {
                if let Some(text) = output.plain_text() {
                    println!("{}", text.trim_end());
                }
            }
        }
    }
}
