//! # Action container
//!
//! An [`Active`] holds everything one dispatched action owns on its server:
//! the output directory, one stream file per declared sample key, the
//! accumulated sample lists and its entry in the server's status registry.
//!
//! Lifecycle: `myinit` (directory, streams, registered as running) → handler
//! pushes data → `finish` or `fail` (drain, close, write the record, leave
//! the registry). `stop` is the emergency-stop ending: the record carries a
//! `stopped` error and the id keeps its estopped tag. A container dropped
//! without any of these still closes its streams but stays live.

pub mod record;
pub mod stream;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::action_server::ServerContext;
use crate::error::Result;
use crate::io::{ensure_dir, path_safe};
use crate::model::{
    Action, ActionError, ErrorCode, Sample, SampleInheritance, SampleIo, SampleStatus,
    SampleType,
};
use crate::status::InstanceState;

pub use record::{ActionRecord, FileEntry, RECORD_FILE, RECORD_VERSION};
pub use stream::{
    read_stream, DataEvent, DataSender, ParsedStream, StreamHeader, StreamSpec, HEADER_TERMINATOR,
};

use stream::{drain, file_name_of, Queued, StreamWriter};

pub struct Active {
    ctx: Arc<ServerContext>,
    action: Action,
    id: Uuid,
    dir: PathBuf,
    sender: Option<DataSender>,
    /// Reaches the drain without keeping its queue open.
    cutoff: mpsc::WeakUnboundedSender<Queued>,
    drain: Option<JoinHandle<Vec<FileEntry>>>,
    /// Manifest fallback if the drain task has to be cut off.
    declared: Vec<FileEntry>,
}

/// `data_root/<year><week>/<pg date>/<pg time>__<label>/<queue time>__<server>__<op>__<id>`
pub fn output_dir(data_root: &Path, action: &Action, id: Uuid, now: DateTime<Utc>) -> PathBuf {
    let (pg_time, label) = match &action.process_group {
        Some(pg) => (pg.started_at, pg.label.as_str()),
        None => (now, "no-group"),
    };
    let queued = action.queued_at.unwrap_or(now);
    data_root
        .join(pg_time.format("%Y%W").to_string())
        .join(pg_time.format("%Y%m%d").to_string())
        .join(format!("{}__{}", pg_time.format("%H%M%S%3f"), path_safe(label)))
        .join(format!(
            "{}__{}__{}__{}",
            queued.format("%H%M%S%3f"),
            path_safe(&action.server),
            path_safe(&action.operation),
            id
        ))
}

impl Active {
    /// Create the container: assign the id if missing, create the output
    /// directory, open the declared streams when `save_data` is set and
    /// register the id as running.
    pub fn myinit(mut action: Action, ctx: Arc<ServerContext>, specs: &[StreamSpec]) -> Result<Self> {
        let id = *action.id.get_or_insert_with(Uuid::new_v4);
        let dir = output_dir(&ctx.data_root, &action, id, Utc::now());
        ensure_dir(&dir)?;
        action.output_dir = Some(dir.clone());

        let mut writers = BTreeMap::new();
        let mut declared = Vec::new();
        if action.save_data {
            for spec in specs {
                let name = format!(
                    "{}__{}.dat",
                    path_safe(&action.operation),
                    path_safe(&spec.sample_key)
                );
                let path = dir.join(&name);
                declared.push(FileEntry {
                    file_name: file_name_of(&path),
                    sample_key: spec.sample_key.clone(),
                    column_headings: spec
                        .header
                        .as_ref()
                        .map(|h| h.column_headings.clone())
                        .unwrap_or_default(),
                    rows: None,
                });
                writers.insert(spec.sample_key.clone(), StreamWriter::create(path, spec)?);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cutoff = tx.downgrade();
        let drain = tokio::task::spawn_blocking(move || drain(rx, writers));

        ctx.status.register(&action.operation, id);
        info!(
            action_id = %id,
            server = %action.server,
            operation = %action.operation,
            dir = %dir.display(),
            streams = declared.len(),
            "action container created"
        );

        Ok(Self {
            ctx,
            action,
            id,
            dir,
            sender: Some(DataSender::new(tx)),
            cutoff,
            drain: Some(drain),
            declared,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Producer handle for tasks that stream data on the action's behalf.
    pub fn data_sender(&self) -> Option<DataSender> {
        self.sender.clone()
    }

    pub fn update_header(&self, sample_key: &str, fields: Map<String, Value>) {
        if let Some(tx) = &self.sender {
            tx.update_header(sample_key, fields);
        }
    }

    pub fn close_header(&self, sample_key: &str) {
        if let Some(tx) = &self.sender {
            tx.close_header(sample_key);
        }
    }

    pub fn enqueue_data(&self, sample_key: &str, row: Map<String, Value>) {
        if let Some(tx) = &self.sender {
            tx.send_row(sample_key, row);
        }
    }

    pub fn set_process_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.action.process_params.insert(key.into(), value.into());
    }

    /// Record samples on the action. Status defaults to `preserved` and
    /// inheritance to `allow_both`.
    pub fn append_sample(
        &mut self,
        samples: Vec<Sample>,
        io: SampleIo,
        status: Option<SampleStatus>,
        inheritance: Option<SampleInheritance>,
    ) -> Result<()> {
        let status = status.unwrap_or(SampleStatus::Preserved);
        let inheritance = inheritance.unwrap_or(SampleInheritance::AllowBoth);
        samples.iter().try_for_each(Sample::validate)?;
        for mut sample in samples {
            sample.status.push(status);
            sample.inheritance = Some(inheritance);
            match io {
                SampleIo::In => self.action.samples_in.push(sample),
                SampleIo::Out => self.action.samples_out.push(sample),
            }
        }
        Ok(())
    }

    /// Number a fresh sample from the server's counter.
    pub async fn new_sample(&self, sample_type: SampleType) -> Sample {
        self.ctx.new_sample(sample_type).await
    }

    /// Drain, close, record and leave the registry.
    pub async fn finish(mut self) -> Result<Action> {
        self.finalize(Settle::Finished).await
    }

    /// Like [`finish`](Self::finish), but records `err` and leaves the id
    /// tagged as errored.
    pub async fn fail(mut self, err: ActionError) -> Result<Action> {
        error!(action_id = %self.id, error = %err, "action failed");
        self.action.error = Some(err);
        self.finalize(Settle::Failed).await
    }

    /// Close out an emergency-stopped action. The registry entry is left to
    /// whoever engaged the stop.
    pub async fn stop(mut self) -> Result<Action> {
        warn!(action_id = %self.id, "action stopped by emergency stop");
        self.action.error = Some(ActionError::new(ErrorCode::Stopped, "emergency stop"));
        self.finalize(Settle::Stopped).await
    }

    fn cut_off(&self) {
        if let Some(tx) = self.cutoff.upgrade() {
            let _ = tx.send(Queued::CutOff);
        }
    }

    async fn finalize(&mut self, settle: Settle) -> Result<Action> {
        self.sender = None;
        let files = match self.drain.take() {
            Some(mut handle) => {
                match tokio::time::timeout(self.ctx.finish_grace, &mut handle).await {
                    Ok(Ok(files)) => files,
                    Ok(Err(e)) => {
                        error!(action_id = %self.id, error = %e, "drain task failed");
                        self.declared.clone()
                    }
                    Err(_) => {
                        warn!(
                            action_id = %self.id,
                            grace = ?self.ctx.finish_grace,
                            "data still queued after grace period, closing anyway"
                        );
                        self.cut_off();
                        match handle.await {
                            Ok(files) => files,
                            Err(e) => {
                                error!(action_id = %self.id, error = %e, "drain task failed");
                                self.declared.clone()
                            }
                        }
                    }
                }
            }
            None => Vec::new(),
        };

        let written = if self.action.save_record {
            ActionRecord::from_action(&self.action, &self.ctx.machine, &self.ctx.access, files)
                .and_then(|record| record.write(&self.dir))
                .map(Some)
        } else {
            Ok(None)
        };

        match settle {
            Settle::Finished => {
                self.ctx.status.remove(&self.action.operation, self.id);
            }
            Settle::Failed => {
                self.ctx
                    .status
                    .set(&self.action.operation, self.id, InstanceState::Errored);
            }
            Settle::Stopped => {}
        }

        match &written {
            Ok(Some(path)) => info!(action_id = %self.id, record = %path.display(), "action finished"),
            Ok(None) => info!(action_id = %self.id, "action finished, record not saved"),
            Err(e) => error!(action_id = %self.id, error = %e, "could not write action record"),
        }
        written?;
        Ok(self.action.clone())
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Finished,
    Failed,
    Stopped,
}

impl Drop for Active {
    fn drop(&mut self) {
        if self.drain.take().is_some() {
            self.cut_off();
        }
    }
}

impl std::fmt::Debug for Active {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Active")
            .field("id", &self.id)
            .field("server", &self.action.server)
            .field("operation", &self.action.operation)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
