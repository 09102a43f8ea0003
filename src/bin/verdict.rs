#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use verdict_harness::gateway::{
    Attribution, JudgeModelId, NoopUsageSink, ProviderGateway, StderrUsageSink,
};
use verdict_harness::prompts::{PlaceholderTemplate, SystemMessage};
use verdict_harness::reward::{evaluate_reward_bench, LlmPairwiseJudge, RewardBenchInstance};
use verdict_harness::scorer::{FreeTextScorer, ScoreOutcome, TaskInputs, WeightedLabelScorer};

#[derive(Parser)]
#[command(name = "verdict", version, about = "LLM-as-judge scoring harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score model outputs with a free-text judge
    Score {
        /// JSONL dataset: one instance per line with "lm_output", optional
        /// "references" (list), and arbitrary task-input fields
        #[arg(long)]
        dataset: PathBuf,
        /// File holding the judge prompt template ({field} placeholders)
        #[arg(long)]
        template: PathBuf,
        /// Output report JSON
        #[arg(long)]
        out: PathBuf,
        /// OpenRouter model ID for the judge
        #[arg(long, default_value = "openai/gpt-4o-mini")]
        model: String,
        /// Present prompts as chat turns instead of flat text
        #[arg(long)]
        chat: bool,
        /// System message for chat mode
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Inclusive score range; parsed values outside it are discarded
        #[arg(long, requires = "max_score")]
        min_score: Option<i64>,
        #[arg(long, requires = "min_score")]
        max_score: Option<i64>,
        /// Task-input field used for per-category means
        #[arg(long)]
        category_key: Option<String>,
        /// Name the metric in the report (default: "llm_score")
        #[arg(long, default_value = "llm_score")]
        metric: String,
        /// Also write per-instance results to this JSONL file
        #[arg(long)]
        instances_out: Option<PathBuf>,
        /// Emit per-call usage records to stderr
        #[arg(long)]
        log_usage: bool,
    },
    /// Score model outputs as a probability-weighted label expectation
    Geval {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "openai/gpt-4o-mini")]
        model: String,
        #[arg(long)]
        chat: bool,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Inclusive label range; one integer label per value
        #[arg(long, default_value_t = 1)]
        min_score: i64,
        #[arg(long, default_value_t = 5)]
        max_score: i64,
        #[arg(long)]
        category_key: Option<String>,
        #[arg(long, default_value = "llm_geval_score")]
        metric: String,
        #[arg(long)]
        instances_out: Option<PathBuf>,
        #[arg(long)]
        log_usage: bool,
    },
    /// Judge chosen/rejected pairs and report accuracy
    RewardBench {
        /// JSONL dataset: {"prompt", "chosen", "rejected"} per line
        #[arg(long)]
        dataset: PathBuf,
        /// Pairwise template referencing {prompt}, {answer_a}, {answer_b}
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "openai/gpt-4o-mini")]
        model: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Evaluate at most this many pairs
        #[arg(long)]
        max_instances: Option<usize>,
        #[arg(long)]
        instances_out: Option<PathBuf>,
        #[arg(long)]
        log_usage: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Score {
            dataset,
            template,
            out,
            model,
            chat,
            system,
            batch_size,
            min_score,
            max_score,
            category_key,
            metric,
            instances_out,
            log_usage,
        } => {
            let instances = read_score_dataset(&dataset)?;
            let template = load_template(&template)?;
            let judge = build_gateway(model, log_usage)?;

            let mut scorer = FreeTextScorer::new(judge, template);
            if chat {
                scorer = scorer.chat_mode();
            }
            if let Some(system) = system {
                scorer = scorer.system_message(SystemMessage::Literal(system));
            }
            if let Some(batch_size) = NonZeroUsize::new(batch_size) {
                scorer = scorer.batch_size(batch_size);
            } else {
                return Err("--batch-size must be >= 1".into());
            }
            if let (Some(lo), Some(hi)) = (min_score, max_score) {
                scorer = scorer.valid_score_range(lo, hi)?;
            }
            if let Some(key) = category_key {
                scorer = scorer.category_key(key);
            }

            let outcome = scorer
                .evaluate(
                    &instances.lm_outputs,
                    instances.references.as_deref(),
                    Some(&instances.task_inputs),
                )
                .await?;
            write_outcome(&out, instances_out.as_ref(), &metric, outcome)?;
        }
        Commands::Geval {
            dataset,
            template,
            out,
            model,
            chat,
            system,
            batch_size,
            min_score,
            max_score,
            category_key,
            metric,
            instances_out,
            log_usage,
        } => {
            let instances = read_score_dataset(&dataset)?;
            let template = load_template(&template)?;
            let judge = build_gateway(model, log_usage)?;

            let mut scorer = WeightedLabelScorer::new(judge, template, (min_score, max_score))?;
            if chat {
                scorer = scorer.chat_mode();
            }
            if let Some(system) = system {
                scorer = scorer.system_message(SystemMessage::Literal(system));
            }
            if let Some(batch_size) = NonZeroUsize::new(batch_size) {
                scorer = scorer.batch_size(batch_size);
            } else {
                return Err("--batch-size must be >= 1".into());
            }
            if let Some(key) = category_key {
                scorer = scorer.category_key(key);
            }

            let outcome = scorer
                .evaluate(
                    &instances.lm_outputs,
                    instances.references.as_deref(),
                    Some(&instances.task_inputs),
                )
                .await?;
            write_outcome(&out, instances_out.as_ref(), &metric, outcome)?;
        }
        Commands::RewardBench {
            dataset,
            template,
            out,
            model,
            system,
            batch_size,
            max_instances,
            instances_out,
            log_usage,
        } => {
            let pairs: Vec<RewardBenchInstance> = read_jsonl(&dataset)?;
            let template = load_template(&template)?;
            let judge_model = build_gateway(model, log_usage)?;

            let mut judge = LlmPairwiseJudge::new(judge_model, template);
            if let Some(system) = system {
                judge = judge.system_message(SystemMessage::Literal(system));
            }
            let batch_size =
                NonZeroUsize::new(batch_size).ok_or("--batch-size must be >= 1")?;

            let (report, judgments) =
                evaluate_reward_bench(&judge, &pairs, batch_size, max_instances).await?;
            write_json(&out, &report)?;
            if let Some(path) = instances_out {
                write_jsonl(&path, &judgments)?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Column-wise view of a scoring dataset read from JSONL.
struct ScoreDataset {
    lm_outputs: Vec<String>,
    references: Option<Vec<Vec<String>>>,
    task_inputs: Vec<TaskInputs>,
}

fn read_score_dataset(path: &PathBuf) -> Result<ScoreDataset, Box<dyn std::error::Error>> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = read_jsonl(path)?;

    let mut lm_outputs = Vec::with_capacity(rows.len());
    let mut references: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    let mut any_references = false;
    let mut task_inputs = Vec::with_capacity(rows.len());

    for (line, row) in rows.into_iter().enumerate() {
        let lm_output = row
            .get("lm_output")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("line {}: missing string field \"lm_output\"", line + 1))?;
        lm_outputs.push(lm_output.to_string());

        let refs = match row.get("references") {
            Some(serde_json::Value::Array(items)) => {
                any_references = true;
                items
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => Ok(s.clone()),
                        other => Err(format!(
                            "line {}: reference entries must be strings, got {other}",
                            line + 1
                        )),
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            Some(other) => {
                return Err(
                    format!("line {}: \"references\" must be a list, got {other}", line + 1).into(),
                )
            }
            None => Vec::new(),
        };
        references.push(refs);

        let mut inputs = TaskInputs::new();
        for (key, value) in &row {
            if key == "lm_output" || key == "references" {
                continue;
            }
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            inputs.insert(key.clone(), text);
        }
        task_inputs.push(inputs);
    }

    Ok(ScoreDataset {
        lm_outputs,
        references: any_references.then_some(references),
        task_inputs,
    })
}

fn build_gateway(
    model: String,
    log_usage: bool,
) -> Result<Arc<dyn verdict_harness::JudgeModel>, Box<dyn std::error::Error>> {
    let model = JudgeModelId::OpenRouter(model);
    let attribution = Attribution::new("verdict-cli");
    if log_usage {
        let gateway = ProviderGateway::from_env(model, Arc::new(StderrUsageSink))?
            .attribution(attribution);
        Ok(Arc::new(gateway))
    } else {
        let gateway = ProviderGateway::from_env(model, Arc::new(NoopUsageSink))?
            .attribution(attribution);
        Ok(Arc::new(gateway))
    }
}

fn load_template(
    path: &PathBuf,
) -> Result<Arc<dyn verdict_harness::PromptTemplate>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(Arc::new(PlaceholderTemplate::new(raw.trim_end())))
}

fn write_outcome(
    report_path: &PathBuf,
    instances_path: Option<&PathBuf>,
    metric: &str,
    outcome: ScoreOutcome,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = outcome.summary.to_report(metric);
    write_json(report_path, &report)?;
    if let Some(path) = instances_path {
        write_jsonl(path, &outcome.instances)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_jsonl<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<Vec<T>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut rows = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {e}", path.display(), i + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

fn write_jsonl<T: serde::Serialize>(path: &PathBuf, rows: &[T]) -> Result<(), io::Error> {
    use std::io::Write;
    let mut file = File::create(path)?;
    for row in rows {
        let line = serde_json::to_string(row).map_err(io::Error::other)?;
        writeln!(file, "{line}")?;
    }
    Ok(())
}
