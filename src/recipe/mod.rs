//! # Recipes
//!
//! A recipe is a small graph of processing steps carried inside every message.
//! This module parses and validates recipes, resolves `$variable` references
//! against the recipe environment and provides [`RecipeWrapper`], the
//! per-message view handlers use to publish downstream or checkpoint.

pub mod graph;
pub mod message;
pub mod parameters;
pub mod substitution;
pub mod wrapper;

use thiserror::Error;

use crate::messaging::TransportError;

pub use graph::{Recipe, RecipeStep, StepLabel};
pub use message::MessageBody;
pub use parameters::ParameterChain;
pub use substitution::{substitute, substitute_value};
pub use wrapper::RecipeWrapper;

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("Invalid recipe: {reason}")]
    InvalidRecipe { reason: String },

    #[error("Recipe has no step {label}")]
    MissingStep { label: StepLabel },

    #[error("Invalid recipe message: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("Step {label} has neither a queue nor a topic")]
    NoDestination { label: StepLabel },

    #[error("Operation '{operation}' requires a recipe-wrapped message")]
    NotRecipeWrapped { operation: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RecipeError {
    pub fn invalid_recipe<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRecipe {
            reason: reason.into(),
        }
    }

    pub fn missing_step(label: StepLabel) -> Self {
        Self::MissingStep { label }
    }

    pub fn invalid_envelope<S: Into<String>>(reason: S) -> Self {
        Self::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    pub fn not_recipe_wrapped<S: Into<String>>(operation: S) -> Self {
        Self::NotRecipeWrapped {
            operation: operation.into(),
        }
    }

    /// The message itself is at fault; redelivering it cannot help
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecipe { .. } | Self::MissingStep { .. } | Self::InvalidEnvelope { .. }
        )
    }
}

pub type RecipeResult<T> = Result<T, RecipeError>;
