use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Tensor};
use clap::Parser;
use model::{Mode, TransformerOutput};
use mtatrack::setup_device;
use serde_json::{Number, Value};
use tracker::{build_box_head, build_transformer, BoxHead, TrackerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs the tracking transformer on synthetic features", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON tracker config")]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value = "all", help = "Transformer mode: all or encoder")]
    mode: String,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    #[arg(long, default_value_t = 8, help = "Side of each template feature map")]
    template_size: usize,

    #[arg(long, default_value_t = 2, help = "Number of template frames")]
    templates: usize,

    #[arg(long, default_value_t = 16, help = "Side of the search feature map")]
    search_size: usize,

    #[arg(long, help = "Keep dropout active")]
    train: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl std::str::FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate().context("invalid configuration")?;

    let device = setup_device()?;
    let transformer =
        build_transformer(&config, &device).context("failed to build the transformer")?;
    transformer.set_training(args.train);
    let mode: Mode = args.mode.parse()?;

    let hidden = config.model.hidden_dim;
    let dtype = config.model.precision.dtype();
    let seq_len =
        args.templates * args.template_size * args.template_size + args.search_size * args.search_size;
    if seq_len == 0 || args.batch == 0 {
        bail!("the synthetic input must have at least one token and one batch entry");
    }
    log::info!(
        "synthetic input: {} tokens x batch {} x {} channels",
        seq_len,
        args.batch,
        hidden
    );

    let feat = Tensor::randn(0f32, 1.0, (seq_len, args.batch, hidden), &device)?.to_dtype(dtype)?;
    let pos = Tensor::randn(0f32, 1.0, (seq_len, args.batch, hidden), &device)?.to_dtype(dtype)?;
    let mask = Tensor::zeros((args.batch, seq_len), DType::U8, &device)?;
    let queries = Tensor::randn(0f32, 1.0, (config.model.num_object_queries, hidden), &device)?
        .to_dtype(dtype)?;

    let output = transformer.forward(&feat, Some(&mask), &queries, Some(&pos), mode, true)?;
    for report in output.diagnose()? {
        report.log();
    }

    match output {
        TransformerOutput::Memory(memory) => {
            for (index, layer) in memory.tensors().iter().enumerate() {
                log::info!("memory[{index}]: {:?}", layer.dims());
            }
        }
        TransformerOutput::Decoded { hs, taps } => {
            log::info!("decoder output: {:?}", hs.dims());
            let (memory0, memory5) =
                taps.ok_or_else(|| anyhow!("transformer returned no memory taps"))?;
            let output_embed = hs.transpose(1, 2)?.contiguous()?;
            let head = build_box_head(&config, &device)?;
            let (_, coords) = head.forward(&output_embed, &memory0, &memory5)?;
            let coords = coords.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            log::info!("predicted boxes: {coords:?}");
        }
    }
    Ok(())
}

fn apply_overrides(config: TrackerConfig, overrides: &[OverrideArg]) -> Result<TrackerConfig> {
    let mut value =
        serde_json::to_value(config).context("failed to serialize config for overrides")?;
    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    serde_json::from_value(value).context("failed to deserialize config after overrides")
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<()> {
    let mut current = target;
    let segments = path.split('.').collect::<Vec<_>>();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("override path must not be empty"))?;
    for segment in parents {
        current = current
            .as_object_mut()
            .ok_or_else(|| anyhow!("override path '{path}' crosses a non-table value"))?
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    let table = current
        .as_object_mut()
        .ok_or_else(|| anyhow!("override path '{path}' crosses a non-table value"))?;
    if !table.contains_key(*last) {
        bail!("unknown configuration key '{path}'");
    }
    table.insert(last.to_string(), new_value);
    Ok(())
}
