//! # Tempo: Script Scheduler
//!
//! Runs Python, Node.js and shell scripts on daily, weekly, monthly or cron
//! schedules, keeps a run history and pushes results to chat robots.
//!
//! Usage:
//!   tempo serve                                    # Run the scheduler until Ctrl-C
//!   tempo script add --name backup --kind shell --path backup.sh
//!   tempo task add --name nightly --script <ID> --daily 02:30 --active
//!   tempo logs --task <ID> --limit 20

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tempo_core::TempoConfig;
use tempo_scheduler::{
    ChannelConfig, RunRecord, Schedule, SchedulerEngine, SchedulerHandle, ScriptDraft,
    ScriptKind, ScriptSource, TaskDraft, TaskStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tempo",
    version,
    about = "⏰ Tempo: run scripts on a schedule and report the results"
)]
struct Cli {
    /// Config file (default: ~/.tempo/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler in the foreground until Ctrl-C
    Serve,
    /// Manage scripts
    #[command(subcommand)]
    Script(ScriptCommand),
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Show run history, newest first
    Logs {
        /// Only runs of this task
        #[arg(short, long)]
        task: Option<String>,
        /// Number of records (default 50 for one task, 100 overall)
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Manage notification channels
    #[command(subcommand)]
    Notifier(NotifierCommand),
    /// Manage environment variables passed to every script
    #[command(subcommand)]
    Env(EnvCommand),
    /// Show task and run counts
    Stats,
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// Register a script
    Add {
        #[arg(long)]
        name: String,
        /// python, nodejs or shell
        #[arg(long)]
        kind: ScriptKind,
        /// File to run (relative paths resolve against the scripts directory)
        #[arg(long, conflicts_with_all = ["code", "code_file"])]
        path: Option<String>,
        /// Inline source code
        #[arg(long, conflicts_with = "code_file")]
        code: Option<String>,
        /// Read inline source code from a file
        #[arg(long)]
        code_file: Option<PathBuf>,
        #[arg(long, default_value = "")]
        description: String,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Override the runner timeout for this script
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List scripts
    List,
    /// Show one script as JSON
    Show { id: String },
    /// Delete a script that no task uses
    Rm { id: String },
    /// Run a script now and print the record
    Run {
        id: String,
        /// Send the result to enabled notifiers
        #[arg(long)]
        notify: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Add {
        #[arg(long)]
        name: String,
        /// Script id
        #[arg(long)]
        script: String,
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[arg(long, default_value = "")]
        description: String,
        /// Activate immediately (tasks start inactive otherwise)
        #[arg(long)]
        active: bool,
    },
    /// List tasks
    List,
    /// Show one task as JSON
    Show { id: String },
    /// Delete a task
    Rm { id: String },
    /// Switch a task between active and inactive
    Toggle { id: String },
    /// Run a task now and print the record
    Run { id: String },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ScheduleArgs {
    /// Every day at HH:MM
    #[arg(long, value_name = "HH:MM")]
    daily: Option<String>,
    /// Weekly, e.g. "09:15 1,3,5" (0 = Sunday)
    #[arg(long, value_name = "HH:MM DAYS")]
    weekly: Option<String>,
    /// Monthly, e.g. "06:00 15"
    #[arg(long, value_name = "HH:MM DAY")]
    monthly: Option<String>,
    /// Six-field cron expression: sec min hour dom month dow
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,
}

#[derive(Subcommand)]
enum NotifierCommand {
    /// Add a notification channel
    Add {
        #[arg(long)]
        name: String,
        /// dingtalk, wechat, lark or webhook
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        webhook: String,
        /// Lark signing secret
        #[arg(long)]
        secret: Option<String>,
    },
    /// Replace a channel's name and target
    Update {
        id: String,
        #[arg(long)]
        name: String,
        /// dingtalk, wechat, lark or webhook
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        webhook: String,
        /// Lark signing secret
        #[arg(long)]
        secret: Option<String>,
    },
    /// List channels
    List,
    /// Delete a channel
    Rm { id: String },
    /// Enable a channel
    Enable { id: String },
    /// Disable a channel
    Disable { id: String },
}

#[derive(Subcommand)]
enum EnvCommand {
    /// List variables
    List,
    /// Set a variable
    Set { key: String, value: String },
    /// Remove a variable
    Rm { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "tempo=debug,tempo_scheduler=debug"
    } else {
        "tempo=info,tempo_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TempoConfig::load_from(&expand_path(path))?,
        None => TempoConfig::load()?,
    };
    let handle = SchedulerEngine::from_config(&config)?;

    let result = match cli.command {
        Command::Serve => serve(&handle, &config).await,
        Command::Script(cmd) => script_command(&handle, cmd).await,
        Command::Task(cmd) => task_command(&handle, cmd).await,
        Command::Logs { task, limit } => {
            let records = handle.logs(task.as_deref(), limit)?;
            if records.is_empty() {
                println!("No runs recorded.");
            }
            for record in &records {
                print_record_line(record);
            }
            Ok(())
        }
        Command::Notifier(cmd) => notifier_command(&handle, cmd),
        Command::Env(cmd) => env_command(&handle, cmd),
        Command::Stats => {
            let stats = handle.stats().await?;
            println!("📊 Tasks: {} ({} active)", stats.total_tasks, stats.active_tasks);
            println!(
                "   Runs:  {} ({} succeeded, {} failed)",
                stats.total_runs, stats.success_runs, stats.failed_runs
            );
            Ok(())
        }
    };

    handle.shutdown().await?;
    result
}

fn expand_path(p: &std::path::Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).to_string())
}

async fn serve(handle: &SchedulerHandle, config: &TempoConfig) -> Result<()> {
    println!("⏰ Tempo v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:    {}", config.db_path().display());
    println!("   📂 Scripts dir: {}", config.scripts_dir().display());
    println!("   ⚙️  Workers:     {}", config.scheduler.max_concurrent);
    println!();

    handle.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    println!("\n🛑 Stopping, waiting for running scripts...");
    handle.stop().await?;
    Ok(())
}

async fn script_command(handle: &SchedulerHandle, cmd: ScriptCommand) -> Result<()> {
    let scripts = handle.scripts();
    match cmd {
        ScriptCommand::Add {
            name,
            kind,
            path,
            code,
            code_file,
            description,
            tags,
            timeout,
        } => {
            let source = match (path, code, code_file) {
                (Some(path), _, _) => ScriptSource::Path { path },
                (_, Some(code), _) => ScriptSource::Inline { code },
                (_, _, Some(file)) => ScriptSource::Inline {
                    code: std::fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?,
                },
                _ => bail!("one of --path, --code or --code-file is required"),
            };
            let draft = ScriptDraft {
                name,
                description,
                kind,
                source,
                tags,
                timeout_secs: timeout,
            };
            let script = scripts.create(draft)?;
            println!("✅ Script added: {} ({})", script.name, script.id);
        }
        ScriptCommand::List => {
            let list = scripts.list()?;
            if list.is_empty() {
                println!("No scripts.");
            }
            for s in list {
                let source = match &s.source {
                    ScriptSource::Path { path } => path.clone(),
                    ScriptSource::Inline { .. } => "<inline>".to_string(),
                };
                let last = s
                    .last_run_at
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                println!("{}  {:<7} {:<24} {:<30} last run: {last}", s.id, s.kind, s.name, source);
            }
        }
        ScriptCommand::Show { id } => {
            println!("{}", serde_json::to_string_pretty(&scripts.get(&id)?)?);
        }
        ScriptCommand::Rm { id } => {
            scripts.delete(&id)?;
            println!("🗑️ Script deleted: {id}");
        }
        ScriptCommand::Run { id, notify } => {
            let record = handle.run_script(&id, notify).await?.wait().await?;
            print_record(&record);
        }
    }
    Ok(())
}

async fn task_command(handle: &SchedulerHandle, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Add {
            name,
            script,
            schedule,
            description,
            active,
        } => {
            let mut draft = TaskDraft::new(&name, &script, schedule.into_schedule()?);
            draft.description = description;
            if active {
                draft = draft.active();
            }
            let task = handle.create_task(draft).await?;
            println!("📅 Task added: {} ({}) [{}]", task.name, task.id, task.cron);
            if let Some(next) = task.next_run_at {
                println!("   Next run: {}", next.with_timezone(&chrono::Local));
            }
        }
        TaskCommand::List => {
            let tasks = handle.list_tasks()?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for t in tasks {
                let next = t
                    .next_run_at
                    .map(|at| at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                let icon = match t.status {
                    TaskStatus::Active => "🟢",
                    TaskStatus::Inactive => "⚪",
                };
                println!("{icon} {}  {:<24} {:<22} next: {next}", t.id, t.name, t.cron);
            }
        }
        TaskCommand::Show { id } => {
            println!("{}", serde_json::to_string_pretty(&handle.get_task(&id)?)?);
        }
        TaskCommand::Rm { id } => {
            handle.delete_task(&id).await?;
            println!("🗑️ Task deleted: {id}");
        }
        TaskCommand::Toggle { id } => {
            let task = handle.toggle_task(&id).await?;
            println!("🔀 Task '{}' is now {}", task.name, task.status);
        }
        TaskCommand::Run { id } => {
            let record = handle.run_task_now(&id).await?.wait().await?;
            print_record(&record);
        }
    }
    Ok(())
}

impl ScheduleArgs {
    fn into_schedule(self) -> Result<Schedule> {
        if let Some(at) = self.daily {
            let (hour, minute) = parse_time(&at)?;
            return Ok(Schedule::Daily { hour, minute });
        }
        if let Some(arg) = self.weekly {
            let (at, days) = arg
                .split_once(' ')
                .context("--weekly expects \"HH:MM DAYS\", e.g. \"09:15 1,3,5\"")?;
            let (hour, minute) = parse_time(at)?;
            let weekdays = days
                .split(',')
                .map(|d| d.trim().parse::<u32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("invalid weekdays '{days}'"))?;
            return Ok(Schedule::Weekly {
                hour,
                minute,
                weekdays,
            });
        }
        if let Some(arg) = self.monthly {
            let (at, day) = arg
                .split_once(' ')
                .context("--monthly expects \"HH:MM DAY\", e.g. \"06:00 15\"")?;
            let (hour, minute) = parse_time(at)?;
            let day = day
                .trim()
                .parse()
                .with_context(|| format!("invalid day of month '{day}'"))?;
            return Ok(Schedule::Monthly { hour, minute, day });
        }
        match self.cron {
            Some(expression) => Ok(Schedule::Custom { expression }),
            None => bail!("a schedule is required: --daily, --weekly, --monthly or --cron"),
        }
    }
}

fn parse_time(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .with_context(|| format!("invalid time '{s}', expected HH:MM"))?;
    let hour = h.parse().with_context(|| format!("invalid hour '{h}'"))?;
    let minute = m.parse().with_context(|| format!("invalid minute '{m}'"))?;
    Ok((hour, minute))
}

fn notifier_command(handle: &SchedulerHandle, cmd: NotifierCommand) -> Result<()> {
    match cmd {
        NotifierCommand::Add {
            name,
            kind,
            webhook,
            secret,
        } => {
            let channel = parse_channel(&kind, webhook, secret)?;
            let notifier = handle.create_notifier(&name, channel)?;
            println!("✅ Notifier added: {} ({})", notifier.name, notifier.id);
        }
        NotifierCommand::Update {
            id,
            name,
            kind,
            webhook,
            secret,
        } => {
            let channel = parse_channel(&kind, webhook, secret)?;
            let notifier = handle.update_notifier(&id, &name, channel)?;
            println!("📝 Notifier updated: {} ({})", notifier.name, notifier.id);
        }
        NotifierCommand::List => {
            let list = handle.list_notifiers()?;
            if list.is_empty() {
                println!("No notifiers.");
            }
            for n in list {
                let icon = if n.enabled { "🟢" } else { "⚪" };
                println!(
                    "{icon} {}  {:<9} {:<20} {}",
                    n.id,
                    n.channel.kind(),
                    n.name,
                    n.channel.webhook()
                );
            }
        }
        NotifierCommand::Rm { id } => {
            handle.delete_notifier(&id)?;
            println!("🗑️ Notifier deleted: {id}");
        }
        NotifierCommand::Enable { id } => {
            let n = handle.set_notifier_enabled(&id, true)?;
            println!("🟢 Notifier '{}' enabled", n.name);
        }
        NotifierCommand::Disable { id } => {
            let n = handle.set_notifier_enabled(&id, false)?;
            println!("⚪ Notifier '{}' disabled", n.name);
        }
    }
    Ok(())
}

fn parse_channel(kind: &str, webhook: String, secret: Option<String>) -> Result<ChannelConfig> {
    Ok(match kind.to_ascii_lowercase().as_str() {
        "dingtalk" => ChannelConfig::Dingtalk { webhook },
        "wechat" | "wecom" => ChannelConfig::Wechat { webhook },
        "lark" | "feishu" => ChannelConfig::Lark { webhook, secret },
        "webhook" => ChannelConfig::Webhook { webhook },
        other => bail!("unknown notifier type '{other}' (dingtalk, wechat, lark, webhook)"),
    })
}

fn env_command(handle: &SchedulerHandle, cmd: EnvCommand) -> Result<()> {
    match cmd {
        EnvCommand::List => {
            for (key, value) in handle.env_vars()? {
                println!("{key}={value}");
            }
        }
        EnvCommand::Set { key, value } => {
            handle.set_env_var(&key, &value)?;
            println!("✅ {key} set");
        }
        EnvCommand::Rm { key } => {
            handle.delete_env_var(&key)?;
            println!("🗑️ {key} removed");
        }
    }
    Ok(())
}

fn print_record_line(r: &RunRecord) {
    let icon = if r.success { "✅" } else { "❌" };
    println!(
        "{icon} {}  {:<24} {:<8} {:>7}ms",
        r.started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S"),
        r.task_name,
        r.status,
        r.duration_ms
    );
}

fn print_record(r: &RunRecord) {
    print_record_line(r);
    if !r.output.is_empty() {
        println!("--- output ---\n{}", r.output.trim_end());
    }
    if !r.error.is_empty() {
        println!("--- error ---\n{}", r.error.trim_end());
    }
}
