//! Step-wise processing passes over the open datasets.
//!
//! An action is configured with json parameters and then driven by repeated calls to
//! [Action::next], each of which does a small amount of work. The editor runs actions on its
//! background worker, holding the editor lock for each step.

pub mod grid;
pub mod ground;

use crate::editor::EditorState;
use crate::index::page_store::PageStoreError;
use ground::{ElevationDescriptor, GroundClassification};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameters: {0}")]
    Parameters(#[from] serde_json::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("There are no datasets to process.")]
    NoDatasets,

    #[error(transparent)]
    Page(#[from] PageStoreError),

    #[error("The action must be given its parameters before it can run.")]
    NotPrepared,
}

#[derive(Debug)]
pub enum Action {
    GroundClassification(GroundClassification),
    ElevationDescriptor(ElevationDescriptor),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::GroundClassification(_) => "ground-classification",
            Action::ElevationDescriptor(_) => "elevation-descriptor",
        }
    }

    /// Validates the parameters and prepares the action for running on the datasets that are
    /// currently active. `null` selects the default parameters.
    pub fn apply_parameters(&mut self, parameters: Value, state: &EditorState) -> Result<(), ActionError> {
        match self {
            Action::GroundClassification(a) => a.apply_parameters(parameters, state),
            Action::ElevationDescriptor(a) => a.apply_parameters(parameters, state),
        }
    }

    /// Does the next bit of work.
    pub fn next(&mut self, state: &mut EditorState) -> Result<(), ActionError> {
        match self {
            Action::GroundClassification(a) => a.next(state),
            Action::ElevationDescriptor(a) => a.next(state),
        }
    }

    /// Between 0 and 1.
    pub fn progress(&self) -> f64 {
        match self {
            Action::GroundClassification(a) => a.progress(),
            Action::ElevationDescriptor(a) => a.progress(),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Action::GroundClassification(a) => a.is_finished(),
            Action::ElevationDescriptor(a) => a.is_finished(),
        }
    }
}

/// Creates actions by name.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, fn() -> Action>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all actions of this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ground-classification", || {
            Action::GroundClassification(GroundClassification::default())
        });
        registry.register("elevation-descriptor", || {
            Action::ElevationDescriptor(ElevationDescriptor::default())
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, create: fn() -> Action) {
        self.actions.insert(name, create);
    }

    pub fn create(&self, name: &str) -> Result<Action, ActionError> {
        let create = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))?;
        Ok(create())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.keys().copied()
    }
}
