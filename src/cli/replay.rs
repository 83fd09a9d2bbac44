use crate::config::Settings;
use crate::fs::{AccessMode, FileHandle, InboundRule, Session, SetFileInfo, ShuffleDriver};
use crate::path::RepoPath;
use crate::shuffle::{PatternTable, ShuffleMatcher};
use crate::store::{MemoryNodeStore, NodeId, NodeStore, NodeTransaction, PropertyValue};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A recorded client session: operations in the order they arrived.
#[derive(Debug, Clone, Deserialize)]
pub struct Trace {
    #[serde(default = "default_session")]
    pub session: u64,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(rename = "step", default)]
    pub steps: Vec<TraceStep>,
}

fn default_session() -> u64 {
    1
}

fn default_user() -> String {
    "replay".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceStep {
    Mkdir {
        path: String,
    },
    Create {
        path: String,
    },
    Open {
        path: String,
        #[serde(default)]
        read_only: bool,
    },
    Write {
        path: String,
        data: String,
        #[serde(default)]
        offset: u64,
    },
    Truncate {
        path: String,
        len: u64,
    },
    Close {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Delete {
        path: String,
    },
    Rmdir {
        path: String,
    },
    DeleteOnClose {
        path: String,
    },
    /// Repository-side change, not a client operation.
    Aspect {
        path: String,
        aspect: String,
    },
    /// Repository-side change, not a client operation.
    Property {
        path: String,
        key: String,
        value: String,
    },
    Pause {
        ms: u64,
    },
}

impl Trace {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

pub async fn replay_trace(config: Option<&Path>, trace_path: &Path) -> Result<()> {
    let settings = match config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Settings::default(),
    };
    let raw = std::fs::read_to_string(trace_path)
        .with_context(|| format!("Failed to read trace {}", trace_path.display()))?;
    let trace = Trace::from_toml(&raw)
        .with_context(|| format!("Failed to parse trace {}", trace_path.display()))?;

    let driver = build_driver(&settings)?;
    let failures = run_trace(&driver, &trace).await;
    info!(
        "Replayed {} steps ({} failed)",
        trace.steps.len(),
        failures.len()
    );

    print!("{}", render_tree(&driver)?);
    Ok(())
}

pub fn build_driver(settings: &Settings) -> Result<ShuffleDriver> {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let matcher = ShuffleMatcher::new(PatternTable::builtin(), settings.shuffle_config());
    let mut driver = ShuffleDriver::new(store, matcher);
    for rule in settings.inbound_rules()? {
        let rule: Arc<dyn InboundRule> = Arc::new(rule);
        driver = driver.with_rule(rule);
    }
    Ok(driver)
}

/// Run every step. Failing steps are reported and skipped, since failed
/// operations are a normal part of some save sequences.
pub async fn run_trace(driver: &ShuffleDriver, trace: &Trace) -> Vec<String> {
    let session = Session::new(trace.session, &trace.user);
    let mut handles: HashMap<String, Vec<FileHandle>> = HashMap::new();
    let mut failures = Vec::new();

    for (index, step) in trace.steps.iter().enumerate() {
        if let Err(e) = run_step(driver, &session, &mut handles, step).await {
            warn!("step {}: {:?} failed: {}", index + 1, step, e);
            failures.push(format!("step {}: {}", index + 1, e));
        }
    }
    failures
}

fn handle_key(path: &str) -> Result<String> {
    Ok(RepoPath::parse(path)?.key())
}

async fn run_step(
    driver: &ShuffleDriver,
    session: &Session,
    handles: &mut HashMap<String, Vec<FileHandle>>,
    step: &TraceStep,
) -> Result<()> {
    match step {
        TraceStep::Mkdir { path } => driver.create_directory(session, path).await?,
        TraceStep::Create { path } => {
            let handle = driver
                .create_file(session, path, AccessMode::ReadWrite)
                .await?;
            handles.entry(handle_key(path)?).or_default().push(handle);
        }
        TraceStep::Open { path, read_only } => {
            let access = if *read_only {
                AccessMode::ReadOnly
            } else {
                AccessMode::ReadWrite
            };
            let handle = driver.open_file(session, path, access).await?;
            handles.entry(handle_key(path)?).or_default().push(handle);
        }
        TraceStep::Write { path, data, offset } => {
            let handle = last_handle(handles, path)?;
            driver
                .write_file(session, handle, *offset, data.as_bytes())
                .await?;
        }
        TraceStep::Truncate { path, len } => {
            let handle = last_handle(handles, path)?;
            driver.truncate_file(session, handle, *len).await?;
        }
        TraceStep::Close { path } => {
            let handle = handles
                .get_mut(&handle_key(path)?)
                .and_then(Vec::pop)
                .ok_or_else(|| anyhow!("{path} is not open"))?;
            driver.close_file(session, handle).await?;
        }
        TraceStep::Rename { from, to } => driver.rename_file(session, from, to).await?,
        TraceStep::Delete { path } => driver.delete_file(session, path).await?,
        TraceStep::Rmdir { path } => driver.delete_directory(session, path).await?,
        TraceStep::DeleteOnClose { path } => {
            driver
                .set_file_information(session, path, SetFileInfo::delete_on_close())
                .await?
        }
        TraceStep::Aspect { path, aspect } => {
            edit_node(driver, path, |txn, node| txn.add_aspect(node, aspect))?
        }
        TraceStep::Property { path, key, value } => edit_node(driver, path, |txn, node| {
            txn.set_property(node, key, PropertyValue::from(value.as_str()))
        })?,
        TraceStep::Pause { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
    }
    Ok(())
}

fn last_handle(handles: &HashMap<String, Vec<FileHandle>>, path: &str) -> Result<FileHandle> {
    handles
        .get(&handle_key(path)?)
        .and_then(|open| open.last().copied())
        .ok_or_else(|| anyhow!("{path} is not open"))
}

fn edit_node<F>(driver: &ShuffleDriver, path: &str, edit: F) -> Result<()>
where
    F: FnOnce(&mut dyn NodeTransaction, NodeId) -> Result<(), crate::store::StoreError>,
{
    let path = RepoPath::parse(path)?;
    let mut txn = driver.store().begin()?;
    let node = txn
        .resolve(&path)?
        .ok_or_else(|| anyhow!("{path} does not exist"))?;
    edit(txn.as_mut(), node)?;
    txn.commit()?;
    Ok(())
}

/// The repository tree followed by the saves each directory recognised.
pub fn render_tree(driver: &ShuffleDriver) -> Result<String> {
    let txn = driver.store().begin()?;
    let mut out = String::new();
    let mut folders = Vec::new();
    render_node(txn.as_ref(), txn.root(), 0, &mut out, &mut folders)?;
    drop(txn);

    for folder in folders {
        for resolution in driver.resolutions(&folder) {
            writeln!(
                out,
                "{} save at {} kept node #{}",
                resolution.pattern, resolution.final_path, resolution.target
            )?;
        }
    }
    Ok(out)
}

fn render_node(
    txn: &dyn NodeTransaction,
    id: NodeId,
    depth: usize,
    out: &mut String,
    folders: &mut Vec<RepoPath>,
) -> Result<()> {
    let record = txn.node(id)?;
    let indent = "  ".repeat(depth);
    if record.is_folder() {
        let name = if depth == 0 { "\\" } else { record.name.as_str() };
        writeln!(out, "{indent}{name}  #{id}")?;
        folders.push(txn.path_of(id)?);

        let mut children = txn
            .children(id)?
            .into_iter()
            .map(|child| -> Result<(String, NodeId)> {
                Ok((txn.node(child)?.name.to_lowercase(), child))
            })
            .collect::<Result<Vec<_>>>()?;
        children.sort();
        for (_, child) in children {
            render_node(txn, child, depth + 1, out, folders)?;
        }
        return Ok(());
    }

    let aspects: Vec<&str> = record.aspects.iter().map(String::as_str).collect();
    writeln!(
        out,
        "{indent}{}  #{}  {} bytes  v{}  [{}]",
        record.name,
        id,
        record.size(),
        record.version_label().unwrap_or("-"),
        aspects.join(", ")
    )?;
    Ok(())
}
