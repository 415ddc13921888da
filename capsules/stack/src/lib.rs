//! Stack capsule: classifies an extracted project and renders the build
//! recipe for it.
//!
//! Both halves sit behind small synchronous traits ([`StackDetector`] and
//! [`RecipeGenerator`]). They touch the filesystem directly, so async callers
//! should run them on a blocking thread.

pub mod detect;
pub mod recipe;
mod templates;

pub use detect::{Detection, MarkerDetector, StackDetector, StackFamily, StackKind};
pub use recipe::{Recipe, RecipeError, RecipeGenerator, TemplateRecipeGenerator, TemplateSource};
