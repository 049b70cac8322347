//! Engine wrapping for training and evaluation models

use std::sync::Arc;

use collective::Collective;
use engine::{
    EngineBackend, EngineConfig, EngineRequest, EvalOptions, LrScheduler, ManagedModel, Model,
    Optimizer, ParameterPartitioner, TrainOptions,
};
use runtime_core::{Error, ModelRole, Result, StrategyConfig};
use tracing::{debug, info};

/// One element of a training group
pub enum Component {
    Model(Model),
    Optimizer(Arc<dyn Optimizer>),
    Scheduler(Arc<dyn LrScheduler>),
}

impl Component {
    fn kind(&self) -> &'static str {
        match self {
            Component::Model(_) => "model",
            Component::Optimizer(_) => "optimizer",
            Component::Scheduler(_) => "scheduler",
        }
    }
}

/// A model to prepare for evaluation, or a group to prepare for training
///
/// A training group must be exactly (model, optimizer, scheduler).
pub enum PrepareEntry {
    Model(Model),
    Group(Vec<Component>),
}

impl PrepareEntry {
    pub fn training(
        model: Model,
        optimizer: Arc<dyn Optimizer>,
        scheduler: Arc<dyn LrScheduler>,
    ) -> Self {
        PrepareEntry::Group(vec![
            Component::Model(model),
            Component::Optimizer(optimizer),
            Component::Scheduler(scheduler),
        ])
    }
}

impl From<Model> for PrepareEntry {
    fn from(model: Model) -> Self {
        PrepareEntry::Model(model)
    }
}

/// An engine-wrapped training triple
pub struct PreparedTraining {
    pub model: ManagedModel,
    pub optimizer: Arc<dyn Optimizer>,
    pub scheduler: Arc<dyn LrScheduler>,
}

/// A prepared entry, in the shape it was requested
pub enum PreparedEntry {
    Eval(ManagedModel),
    Training(PreparedTraining),
}

impl PreparedEntry {
    pub fn into_model(self) -> ManagedModel {
        match self {
            PreparedEntry::Eval(model) => model,
            PreparedEntry::Training(training) => training.model,
        }
    }

    pub fn into_training(self) -> Result<PreparedTraining> {
        match self {
            PreparedEntry::Training(training) => Ok(training),
            PreparedEntry::Eval(_) => Err(Error::invalid_argument(
                "entry was prepared for evaluation, not training",
            )),
        }
    }
}

/// A single entry when one was requested, otherwise all of them in order
pub enum Prepared {
    One(PreparedEntry),
    Many(Vec<PreparedEntry>),
}

impl Prepared {
    pub fn into_vec(self) -> Vec<PreparedEntry> {
        match self {
            Prepared::One(entry) => vec![entry],
            Prepared::Many(entries) => entries,
        }
    }

    pub fn into_one(self) -> Result<PreparedEntry> {
        match self {
            Prepared::One(entry) => Ok(entry),
            Prepared::Many(entries) => Err(Error::invalid_argument(format!(
                "expected one prepared entry, got {}",
                entries.len()
            ))),
        }
    }
}

type TrainingTriple = (Model, Arc<dyn Optimizer>, Arc<dyn LrScheduler>);

enum Validated {
    Eval(Model),
    Training(TrainingTriple),
}

/// Builds engine-wrapped models from the strategy configuration
pub struct ModelPreparer {
    config: StrategyConfig,
    backend: Arc<dyn EngineBackend>,
    collective: Arc<dyn Collective>,
    partitioner: Arc<dyn ParameterPartitioner>,
    local_rank: usize,
}

impl ModelPreparer {
    pub fn new(
        config: StrategyConfig,
        backend: Arc<dyn EngineBackend>,
        collective: Arc<dyn Collective>,
        partitioner: Arc<dyn ParameterPartitioner>,
        local_rank: usize,
    ) -> Self {
        Self {
            config,
            backend,
            collective,
            partitioner,
            local_rank,
        }
    }

    /// Wrap every entry with the engine, preserving order
    ///
    /// All entries are validated before the first engine call, so a malformed
    /// group fails on every rank without any collective traffic.
    pub fn prepare(&self, entries: Vec<PrepareEntry>, is_rlhf: bool) -> Result<Prepared> {
        if entries.is_empty() {
            return Err(Error::invalid_argument("prepare needs at least one entry"));
        }

        let validated = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| validate(index, entry))
            .collect::<Result<Vec<_>>>()?;

        let mut prepared = Vec::with_capacity(validated.len());
        for entry in validated {
            prepared.push(match entry {
                Validated::Eval(model) => PreparedEntry::Eval(self.init_eval(model)?),
                Validated::Training(triple) => {
                    PreparedEntry::Training(self.init_train(triple, is_rlhf)?)
                }
            });
        }

        if prepared.len() == 1 {
            Ok(Prepared::One(prepared.remove(0)))
        } else {
            Ok(Prepared::Many(prepared))
        }
    }

    fn init_train(
        &self,
        (model, optimizer, scheduler): TrainingTriple,
        is_rlhf: bool,
    ) -> Result<PreparedTraining> {
        let options = TrainOptions {
            is_primary: model.role() == ModelRole::Primary,
            is_rlhf,
        };
        let config = EngineConfig::train(&self.config, options);
        info!(
            model = model.name(),
            stage = %config.stage(),
            train_batch_size = config.train_batch_size,
            hybrid_engine = config.hybrid_engine.enabled,
            "Initializing training engine"
        );

        let initialized = self.backend.initialize(EngineRequest {
            model,
            optimizer: Some(optimizer),
            scheduler: Some(scheduler),
            config,
            local_rank: self.local_rank,
            collective: Arc::clone(&self.collective),
            partitioner: Arc::clone(&self.partitioner),
        })?;

        let optimizer = initialized.optimizer.ok_or_else(|| Error::Engine {
            message: "engine returned no optimizer for a training entry".to_string(),
        })?;
        let scheduler = initialized.scheduler.ok_or_else(|| Error::Engine {
            message: "engine returned no scheduler for a training entry".to_string(),
        })?;

        Ok(PreparedTraining {
            model: ManagedModel::Wrapped(initialized.engine),
            optimizer,
            scheduler,
        })
    }

    fn init_eval(&self, model: Model) -> Result<ManagedModel> {
        let options = EvalOptions {
            is_primary: model.role() == ModelRole::Primary,
            is_shadow: model.is_shadow(),
        };
        let config = EngineConfig::eval(&self.config, options);
        debug!(
            model = model.name(),
            stage = %config.stage(),
            offload = config.offloads_parameters(),
            "Initializing evaluation engine"
        );

        let initialized = self.backend.initialize(EngineRequest {
            model,
            optimizer: None,
            scheduler: None,
            config,
            local_rank: self.local_rank,
            collective: Arc::clone(&self.collective),
            partitioner: Arc::clone(&self.partitioner),
        })?;
        Ok(ManagedModel::Wrapped(initialized.engine))
    }
}

fn validate(index: usize, entry: PrepareEntry) -> Result<Validated> {
    let components = match entry {
        PrepareEntry::Model(model) => return Ok(Validated::Eval(model)),
        PrepareEntry::Group(components) => components,
    };

    if components.len() != 3 {
        return Err(Error::invalid_argument(format!(
            "entry {} must be (model, optimizer, scheduler), got {} components",
            index,
            components.len()
        )));
    }

    let kinds: Vec<&str> = components.iter().map(Component::kind).collect();
    let mut components = components.into_iter();
    match (components.next(), components.next(), components.next()) {
        (
            Some(Component::Model(model)),
            Some(Component::Optimizer(optimizer)),
            Some(Component::Scheduler(scheduler)),
        ) => Ok(Validated::Training((model, optimizer, scheduler))),
        _ => Err(Error::invalid_argument(format!(
            "entry {} must be (model, optimizer, scheduler), got ({})",
            index,
            kinds.join(", ")
        ))),
    }
}
