// src/main.rs

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use payroll_core::audit::FileAuditSink;
use payroll_core::cache::JsonFileCache;
use payroll_core::export::{html_report, summarize, write_csv};
use payroll_core::history::{sort_newest_first, HistoryFilter, HistoryService, HistorySource};
use payroll_core::models::{LineItem, MonthYear, PaymentMethod, PaymentStatus, ResetMonthRequest};
use payroll_core::payroll_client::{
    DEFAULT_CACHE_DIR, DEFAULT_CACHE_DURATION_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_STATUS_TIMEOUT_SECS, DEFAULT_SUBMIT_TIMEOUT_SECS,
};
use payroll_core::rates::derive_rates;
use payroll_core::salary_config::SalaryConfigService;
use payroll_core::workflow::{
    ConfirmationRequest, MarkPaidOutcome, DEFAULT_SUBMIT_COOLDOWN_MS,
};
use payroll_core::{
    Confirmer, PayMonthWorkflow, PayrollApi, PayrollClient, PayrollConfig, SalaryConfiguration,
    WorkflowError, WorkflowSettings,
};

// --- Configuration ---

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}
fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_DURATION_SECS
}
fn default_status_timeout() -> u64 {
    DEFAULT_STATUS_TIMEOUT_SECS
}
fn default_submit_timeout() -> u64 {
    DEFAULT_SUBMIT_TIMEOUT_SECS
}
fn default_cooldown() -> u64 {
    DEFAULT_SUBMIT_COOLDOWN_MS
}

/// `PAYROLL_*` environment variables.
#[derive(Debug, Deserialize)]
struct EnvSettings {
    api_base_url: Option<String>,
    api_token: Option<String>,
    operator: Option<String>,
    #[serde(default = "default_cache_dir")]
    cache_dir: PathBuf,
    #[serde(default = "default_cache_ttl")]
    cache_ttl_secs: u64,
    #[serde(default = "default_status_timeout")]
    status_timeout_secs: u64,
    #[serde(default = "default_submit_timeout")]
    submit_timeout_secs: u64,
    #[serde(default = "default_cooldown")]
    submit_cooldown_ms: u64,
}

impl EnvSettings {
    fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        envy::prefixed("PAYROLL_")
            .from_env::<EnvSettings>()
            .context("Failed to read PAYROLL_* environment variables")
    }
}

// --- CLI ---

#[derive(Parser, Debug)]
#[command(name = "payroll", about = "Month-end payroll console", version)]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Overrides PAYROLL_API_BASE_URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Overrides PAYROLL_CACHE_DIR
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List pay months and their status
    Months,
    /// Create a draft pay month (YYYY-MM)
    CreateMonth { month: String },
    /// Show status and payments for a month
    Preview { month: String },
    /// Run the salary calculation for a month
    Calculate { month: String },
    /// Mark a calculated month as paid and send payslips
    MarkPaid { month: String },
    /// Force-reset a month stuck in processing
    ResetMonth {
        month: String,
        #[arg(long, default_value = "Manual reset from payroll console")]
        reason: String,
    },
    /// List employees
    Employees {
        /// Only employees without a salary configuration
        #[arg(long)]
        unconfigured: bool,
    },
    /// Show an employee's salary configuration
    ConfigGet { employee_id: String },
    /// Create or update an employee's salary configuration
    ConfigSet(ConfigSetArgs),
    /// Derive daily, hourly and overtime rates without touching the server
    Rates {
        #[arg(long)]
        base_salary: Decimal,
        #[arg(long, default_value = "22")]
        working_days: Decimal,
        #[arg(long, default_value = "8")]
        daily_hours: Decimal,
        #[arg(long, default_value = "1.5")]
        overtime_multiplier: Decimal,
    },
    /// Payment history, with cache fallback
    History(HistoryArgs),
}

#[derive(clap::Args, Debug)]
struct ConfigSetArgs {
    employee_id: String,
    #[arg(long)]
    base_salary: Option<Decimal>,
    #[arg(long)]
    tax_rate: Option<Decimal>,
    #[arg(long)]
    social_security_rate: Option<Decimal>,
    #[arg(long)]
    working_days: Option<Decimal>,
    #[arg(long)]
    daily_hours: Option<Decimal>,
    #[arg(long)]
    overtime_multiplier: Option<Decimal>,
    /// bank_transfer, check, cash or mobile_money
    #[arg(long, value_parser = parse_payment_method)]
    payment_method: Option<PaymentMethod>,
    #[arg(long)]
    bank_name: Option<String>,
    #[arg(long)]
    bank_account: Option<String>,
    #[arg(long)]
    iban: Option<String>,
    /// NAME=AMOUNT for a fixed amount, NAME=PERCENT% for a share of base salary. Replaces
    /// the stored list when given.
    #[arg(long = "allowance", value_parser = parse_line_item)]
    allowances: Vec<LineItem>,
    #[arg(long = "deduction", value_parser = parse_line_item)]
    deductions: Vec<LineItem>,
    /// Send the stored daily/hourly/overtime rates unchanged
    #[arg(long)]
    keep_rates: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Html,
}

#[derive(clap::Args, Debug)]
struct HistoryArgs {
    #[arg(long)]
    month: Option<String>,
    #[arg(long)]
    employee: Option<String>,
    #[arg(long, value_parser = parse_payment_status)]
    status: Option<PaymentStatus>,
    /// Case-insensitive employee name search
    #[arg(long)]
    search: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
    /// Write to a file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_payment_method(raw: &str) -> Result<PaymentMethod, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown payment method '{}'", raw))
}

fn parse_payment_status(raw: &str) -> Result<PaymentStatus, String> {
    raw.parse()
}

fn parse_line_item(raw: &str) -> Result<LineItem, String> {
    let (name, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=AMOUNT, got '{}'", raw))?;
    let (amount, percentage) = match amount.trim().strip_suffix('%') {
        Some(percent) => (percent, true),
        None => (amount.trim(), false),
    };
    let amount: Decimal = amount
        .trim()
        .parse()
        .map_err(|e| format!("invalid amount in '{}': {}", raw, e))?;
    Ok(if percentage {
        LineItem::percentage(name.trim(), amount)
    } else {
        LineItem::fixed(name.trim(), amount)
    })
}

// --- Operator prompts ---

struct StdinConfirmer {
    assume_yes: bool,
}

impl Confirmer for StdinConfirmer {
    fn confirm(&self, request: &ConfirmationRequest) -> bool {
        if self.assume_yes {
            info!("Auto-confirmed: {}", request);
            return true;
        }
        print!("{} [y/N] ", request);
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!("Could not read confirmation: {}", e);
                false
            }
        }
    }
}

// --- Commands ---

fn print_workflow_error(e: &WorkflowError) {
    match e.route_to() {
        Some(step) => eprintln!("{} (go back to: {})", e, step),
        None => eprintln!("{}", e),
    }
    if e.is_retryable() {
        eprintln!("This failure is temporary; you may retry.");
    }
}

async fn run_preview(workflow: &PayMonthWorkflow, month: &str) -> Result<(), WorkflowError> {
    workflow.select_month(month)?;
    let preview = workflow.load_preview().await?;

    let status = preview
        .pay_month
        .as_ref()
        .map_or("not created".to_string(), |m| m.status.to_string());
    println!("{} ({}): {}", preview.month.month_name(), preview.month, status);
    for p in &preview.payments {
        println!(
            "  {:<30} {:>12} {:>12} {:>12}  {}",
            p.display_name(),
            p.base_salary,
            p.deduction_amount + p.tax_amount,
            p.net_salary,
            p.payment_status
        );
    }
    println!(
        "{} payable employees, total net {}",
        preview.payable().count(),
        preview.total_net()
    );
    println!(
        "Calculate: {}  Mark as paid: {}",
        if workflow.can_calculate() { "available" } else { "blocked" },
        if workflow.can_mark_as_paid() { "available" } else { "blocked" }
    );
    Ok(())
}

async fn run_mark_paid(workflow: &PayMonthWorkflow, month: &str) -> Result<(), WorkflowError> {
    workflow.select_month(month)?;
    workflow.load_preview().await?;
    match workflow.request_mark_as_paid(month).await? {
        MarkPaidOutcome::Paid(report) => println!(
            "{} marked as paid: {} employees, total {}. Emails sent: {}, failed: {}. Request {}",
            report.month,
            report.employees_paid,
            report.total_paid,
            report.emails_sent,
            report.emails_failed,
            report.request_id
        ),
        MarkPaidOutcome::AlreadyPaid {
            month,
            paid_at,
            paid_by,
        } => println!(
            "{} was already paid (at {}, by {}). Nothing submitted.",
            month,
            paid_at.as_deref().unwrap_or("unknown time"),
            paid_by.as_deref().unwrap_or("unknown operator")
        ),
        MarkPaidOutcome::Recovered {
            month,
            status,
            reset_applied,
        } => println!(
            "{} was stuck in processing; {}. Current status: {}. Run mark-paid again to retry.",
            month,
            if reset_applied { "status reset" } else { "state reloaded" },
            status.map_or("unknown".to_string(), |s| s.to_string())
        ),
    }
    Ok(())
}

async fn run_config_set(
    service: &SalaryConfigService,
    args: ConfigSetArgs,
) -> Result<(), WorkflowError> {
    let existing = service.load(&args.employee_id).await?;
    let mut config = match (existing, args.base_salary) {
        (Some(config), _) => config,
        (None, Some(base)) => SalaryConfiguration::new(&args.employee_id, base),
        (None, None) => {
            return Err(WorkflowError::Validation(
                "--base-salary is required for a new configuration".to_string(),
            ))
        }
    };

    if let Some(v) = args.base_salary {
        config.base_salary = v;
    }
    if let Some(v) = args.tax_rate {
        config.tax_rate = v;
    }
    if let Some(v) = args.social_security_rate {
        config.social_security_rate = v;
    }
    if let Some(v) = args.working_days {
        config.working_days = v;
    }
    if let Some(v) = args.daily_hours {
        config.daily_hours = v;
    }
    if let Some(v) = args.overtime_multiplier {
        config.overtime_multiplier = v;
    }
    if let Some(v) = args.payment_method {
        config.payment_method = v;
    }
    if args.bank_name.is_some() {
        config.bank_name = args.bank_name;
    }
    if args.bank_account.is_some() {
        config.bank_account = args.bank_account;
    }
    if args.iban.is_some() {
        config.iban = args.iban;
    }
    if !args.allowances.is_empty() {
        config.allowances = args.allowances;
    }
    if !args.deductions.is_empty() {
        config.deductions = args.deductions;
    }

    let saved = service.save(&config, !args.keep_rates).await?;
    let estimate = saved
        .net_salary_estimate()
        .context("Failed to estimate net salary for the saved configuration")?;
    println!(
        "Saved configuration for employee {}: base {}, daily {}, hourly {}, overtime {}",
        saved.employee_id,
        saved.base_salary,
        saved.daily_rate.map_or("-".to_string(), |r| r.to_string()),
        saved.hourly_rate.map_or("-".to_string(), |r| r.to_string()),
        saved.overtime_rate.map_or("-".to_string(), |r| r.to_string()),
    );
    println!("Estimated net salary: {}", estimate.net);
    Ok(())
}

async fn run_history(service: &HistoryService, args: HistoryArgs) -> Result<()> {
    let loaded = service.load().await?;
    if let HistorySource::Cache { cached_at, age } = loaded.source {
        eprintln!(
            "Server unavailable; showing cached history from {} ({} minutes old)",
            cached_at,
            age.num_minutes()
        );
    }

    let filter = HistoryFilter {
        month_year: args.month,
        employee_id: args.employee,
        status: args.status,
        search: args.search,
    };
    let mut payments: Vec<_> = filter.apply(&loaded.payments).into_iter().cloned().collect();
    sort_newest_first(&mut payments);

    let rendered = match args.format {
        OutputFormat::Csv => {
            let mut buf = Vec::new();
            write_csv(&mut buf, &payments)?;
            String::from_utf8(buf).context("CSV output was not UTF-8")?
        }
        OutputFormat::Html => html_report("Payment history", &payments),
        OutputFormat::Table => {
            let mut out = String::new();
            for p in &payments {
                out.push_str(&format!(
                    "{:<8} {:<30} {:>12} {:<10} {}\n",
                    p.month_year,
                    p.display_name(),
                    p.net_salary,
                    p.payment_status,
                    p.paid_at.as_deref().unwrap_or("")
                ));
            }
            let stats = summarize(&payments);
            out.push_str(&format!(
                "{} payments, total net {}, average net {}\n",
                stats.count, stats.total_net, stats.average_net
            ));
            out
        }
    };

    match args.output {
        Some(path) => {
            fs::write(&path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} payments to {}", payments.len(), path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

async fn run(cli: Cli, env: EnvSettings) -> Result<()> {
    if let Command::Rates {
        base_salary,
        working_days,
        daily_hours,
        overtime_multiplier,
    } = &cli.command
    {
        let rates = derive_rates(*base_salary, *working_days, *daily_hours, *overtime_multiplier)?;
        println!("Daily rate:    {}", rates.daily_rate);
        println!("Hourly rate:   {}", rates.hourly_rate);
        println!("Overtime rate: {}", rates.overtime_rate);
        return Ok(());
    }

    let api_base_url = match cli.base_url.or(env.api_base_url) {
        Some(url) => url,
        None => bail!("PAYROLL_API_BASE_URL is not set (or pass --base-url)"),
    };
    let cache_dir = cli.cache_dir.unwrap_or(env.cache_dir);
    let config = PayrollConfig {
        api_base_url,
        api_token: env.api_token,
        cache_dir: cache_dir.clone(),
        cache_duration_secs: env.cache_ttl_secs,
        status_timeout: Duration::from_secs(env.status_timeout_secs),
        submit_timeout: Duration::from_secs(env.submit_timeout_secs),
        request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
    };
    let api: Arc<dyn PayrollApi> =
        Arc::new(PayrollClient::new(config).context("Failed to initialise payroll client")?);

    let settings = WorkflowSettings {
        status_timeout: Duration::from_secs(env.status_timeout_secs),
        submit_timeout: Duration::from_secs(env.submit_timeout_secs),
        submit_cooldown: Duration::from_millis(env.submit_cooldown_ms),
        operator: env.operator,
        send_emails: true,
    };
    let confirmer = Arc::new(StdinConfirmer {
        assume_yes: cli.yes,
    });
    let workflow = PayMonthWorkflow::new(api.clone(), confirmer.clone(), settings)
        .with_audit(Arc::new(FileAuditSink::in_dir(&cache_dir)));

    let outcome: Result<(), WorkflowError> = match cli.command {
        Command::Rates { .. } => Ok(()),
        Command::Months => workflow.list_pay_months().await.map(|months| {
            for m in months {
                let paid = match (&m.paid_at, &m.paid_by) {
                    (Some(at), Some(by)) => format!(" (paid {} by {})", at, by),
                    (Some(at), None) => format!(" (paid {})", at),
                    _ => String::new(),
                };
                println!("{}  {:<16} {}{}", m.month_year, m.display_name(), m.status, paid);
            }
        }),
        Command::CreateMonth { month } => workflow
            .create_pay_month(&month)
            .await
            .map(|created| println!("Created {} ({})", created.month_year, created.status)),
        Command::Preview { month } => run_preview(&workflow, &month).await,
        Command::Calculate { month } => workflow.request_calculate(&month).await.map(|report| {
            println!(
                "{}: {} calculated, {} failed, total {}{}",
                report.month,
                report.summary.calculated,
                report.summary.failed,
                report.summary.total_amount,
                if report.partial { " (partial)" } else { "" }
            );
            for line in &report.summary.errors {
                println!("  - {}", line);
            }
            if report.recalculated_paid_month {
                println!("Note: this month was already paid; the recalculation was logged.");
            }
        }),
        Command::MarkPaid { month } => run_mark_paid(&workflow, &month).await,
        Command::ResetMonth { month, reason } => {
            let month_year = MonthYear::parse(&month)?;
            if !confirmer.confirm(&ConfirmationRequest::ForceReset { month: month_year }) {
                Err(WorkflowError::Declined)
            } else {
                api.reset_month_status(&ResetMonthRequest {
                    month_year,
                    force: true,
                    reason,
                })
                .await
                .map(|()| println!("Reset status of {}", month_year))
                .map_err(payroll_core::workflow::classify_api_error)
            }
        }
        Command::Employees { unconfigured } => {
            let service = SalaryConfigService::new(api.clone());
            let employees = if unconfigured {
                service.unconfigured_employees().await
            } else {
                service.employees().await
            };
            employees.map(|employees| {
                for e in employees {
                    println!(
                        "{:<8} {:<30} {:<20} {}",
                        e.id,
                        e.full_name(),
                        e.department.as_deref().unwrap_or("-"),
                        if e.has_salary_config { "configured" } else { "no salary config" }
                    );
                }
            })
        }
        Command::ConfigGet { employee_id } => {
            let service = SalaryConfigService::new(api.clone());
            match service.load(&employee_id).await {
                Ok(Some(config)) => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                    if config.rates_out_of_date() {
                        println!("Stored rates do not match the base salary; save again to refresh them.");
                    }
                    Ok(())
                }
                Ok(None) => {
                    println!("Employee {} has no salary configuration", employee_id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Command::ConfigSet(args) => {
            let service = SalaryConfigService::new(api.clone());
            run_config_set(&service, args).await
        }
        Command::History(args) => {
            let cache = JsonFileCache::new(&cache_dir).context("Failed to open cache directory")?;
            let ttl = i64::try_from(env.cache_ttl_secs)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .context("PAYROLL_CACHE_TTL_SECS is out of range")?;
            let service = HistoryService::new(api.clone(), cache, ttl);
            return run_history(&service, args).await;
        }
    };

    if let Err(e) = outcome {
        print_workflow_error(&e);
        return Err(e.into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;

    let env = EnvSettings::from_env()?;
    run(cli, env).await
}
