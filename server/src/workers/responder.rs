/// The Responder worker: terminal response translation for ensembles
use tracing::debug;

use crate::batch::Batch;
use crate::batcher::BatcherKind;
use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::tensor::ModelMetadata;
use crate::worker::{respond, Worker, WorkerContext};

const DEFAULT_BATCH_SIZE: usize = 1;

/// Turns a batch into per-request responses built from the tensors the
/// batch carries as inputs. Load it as the last stage of a chain whose
/// real workers never run callbacks themselves.
pub struct Responder {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl Responder {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("responder", "cpu"),
        }
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for Responder {
    fn init(&mut self, parameters: &ParameterMap) -> Result<(), Error> {
        if let Some(batch_size) = parameters.get_i32("batch_size") {
            if batch_size < 1 {
                return Err(Error::InvalidArgument(format!(
                    "batch_size must be positive, got {batch_size}"
                )));
            }
            self.batch_size = batch_size as usize;
        }
        Ok(())
    }

    fn acquire(&mut self, _parameters: &ParameterMap) -> Result<(), Error> {
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, _ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in responder");
        respond(batch);
        Ok(None)
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn batcher_kind(&self) -> BatcherKind {
        BatcherKind::Hard
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
