use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use plotrun::logging;
use plotrun::logview::{self, Level, LogFollower, LogLine};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Widest window `time` accepts, roughly a century
const MAX_WINDOW_HOURS: i64 = 24 * 366 * 100;

const RULE: &str = "================================================================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Show the most recent lines
    View,
    /// Lines containing a keyword
    Search,
    /// Lines at one level
    Level,
    /// Lines from the last N hours
    Time,
    /// Level counts and request success rate
    Stats,
    /// Follow the file as it grows
    Monitor,
    /// Back up the file and start a fresh one
    Clear,
    /// Delete old log files next to the log
    Prune,
}

/// Inspect and manage the plotrun service log
#[derive(Debug, Parser)]
#[command(name = "plotrun-logs", version)]
struct Args {
    #[arg(value_enum)]
    action: Action,

    /// Log file to operate on
    #[arg(long, default_value = "api.log")]
    file: PathBuf,

    /// Number of lines to show
    #[arg(short = 'l', long, default_value_t = 50)]
    limit: usize,

    /// Keyword for `search`
    #[arg(short = 'k', long)]
    keyword: Option<String>,

    /// Level for `level`
    #[arg(short = 'v', long, value_enum)]
    level: Option<Level>,

    /// Window for `time`, in hours
    #[arg(
        short = 't',
        long,
        default_value_t = 24,
        value_parser = clap::value_parser!(i64).range(0..=MAX_WINDOW_HOURS)
    )]
    hours: i64,

    /// Age threshold for `prune`, in days
    #[arg(long, default_value_t = 30)]
    days: u64,

    /// Do not ask for confirmation
    #[arg(long)]
    yes: bool,
}

fn print_numbered(lines: &[LogLine]) {
    println!("{}", RULE);
    for line in lines {
        println!("line {}: {}", line.number, line.text);
    }
}

fn read_nonempty(path: &Path) -> anyhow::Result<Option<Vec<String>>> {
    let lines = logview::read_lines(path)?;
    if lines.is_empty() {
        println!("Log file is empty");
        return Ok(None);
    }
    Ok(Some(lines))
}

fn view(path: &Path, limit: usize) -> anyhow::Result<()> {
    let Some(lines) = read_nonempty(path)? else {
        return Ok(());
    };
    let recent = logview::tail(&lines, limit);
    println!("Total lines: {}", lines.len());
    println!("Showing last {} lines:", recent.len());
    println!("{}", RULE);
    for line in recent {
        println!("{}", line);
    }
    Ok(())
}

fn search(path: &Path, keyword: &str) -> anyhow::Result<()> {
    let Some(lines) = read_nonempty(path)? else {
        return Ok(());
    };
    let hits = logview::search(&lines, keyword);
    if hits.is_empty() {
        println!("No lines containing '{}'", keyword);
        return Ok(());
    }
    println!("Found {} lines containing '{}':", hits.len(), keyword);
    print_numbered(&hits);
    Ok(())
}

fn level(path: &Path, level: Level) -> anyhow::Result<()> {
    let Some(lines) = read_nonempty(path)? else {
        return Ok(());
    };
    let name = level.marker().trim_matches(|c| c == ' ' || c == '-');
    let hits = logview::filter_level(&lines, level);
    if hits.is_empty() {
        println!("No {} lines", name);
        return Ok(());
    }
    println!("Found {} {} lines:", hits.len(), name);
    print_numbered(&hits);
    Ok(())
}

fn time(path: &Path, hours: i64) -> anyhow::Result<()> {
    let Some(lines) = read_nonempty(path)? else {
        return Ok(());
    };
    let hits = logview::filter_since(&lines, hours, chrono::Local::now().naive_local())?;
    if hits.is_empty() {
        println!("No log lines in the last {} hours", hours);
        return Ok(());
    }
    println!("Log lines from the last {} hours ({}):", hours, hits.len());
    print_numbered(&hits);
    Ok(())
}

fn stats(path: &Path) -> anyhow::Result<()> {
    let Some(lines) = read_nonempty(path)? else {
        return Ok(());
    };
    let stats = logview::stats(&lines);

    println!("Log statistics:");
    println!("{}", &RULE[..50]);
    println!("Total lines:        {}", stats.total_lines);
    println!("INFO:               {}", stats.info);
    println!("WARN:               {}", stats.warning);
    println!("ERROR:              {}", stats.error);
    println!("Requests:           {}", stats.requests);
    println!("Completed:          {}", stats.completed);
    println!("Success rate:       {:.1}%", stats.success_rate);
    if let Some(info) = logging::log_file_info(path)? {
        println!("File size:          {:.1} KB", info.size_kb);
    }

    if !stats.recent_requests.is_empty() {
        println!();
        println!("Most recent requests:");
        for stamp in &stats.recent_requests {
            println!("   {}", stamp);
        }
    }
    Ok(())
}

async fn monitor(path: &Path) -> anyhow::Result<()> {
    let mut follower = LogFollower::new(path)?;
    println!("Monitoring {} (Ctrl+C to stop)...", path.display());
    println!("{}", RULE);

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                println!("Monitoring stopped");
                return Ok(());
            }
            _ = interval.tick() => {
                if let Some(text) = follower.poll()? {
                    println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), text);
                }
            }
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} (y/N): ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn clear(path: &Path, yes: bool) -> anyhow::Result<()> {
    if !path.exists() {
        println!("Log file does not exist, nothing to clear");
        return Ok(());
    }
    if !yes && !confirm("Clear the log file?")? {
        println!("Cancelled");
        return Ok(());
    }
    if let Some(backup) = logview::clear(path, chrono::Local::now())? {
        println!("Log cleared, previous content saved to {}", backup.display());
    }
    Ok(())
}

fn prune(path: &Path, days: u64, yes: bool) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !yes && !confirm(&format!("Delete log files in {} older than {} days?", dir.display(), days))? {
        println!("Cancelled");
        return Ok(());
    }
    let removed = logging::cleanup_old_logs(dir, days)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if removed.is_empty() {
        println!("No log files older than {} days", days);
    }
    for file in removed {
        println!("Removed {}", file.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = args.file.as_path();

    match args.action {
        Action::View => view(path, args.limit),
        Action::Search => match args.keyword.as_deref() {
            Some(keyword) => search(path, keyword),
            None => bail!("search requires --keyword"),
        },
        Action::Level => match args.level {
            Some(lvl) => level(path, lvl),
            None => bail!("level requires --level"),
        },
        Action::Time => time(path, args.hours),
        Action::Stats => stats(path),
        Action::Monitor => monitor(path).await,
        Action::Clear => clear(path, args.yes),
        Action::Prune => prune(path, args.days, args.yes),
    }
}
