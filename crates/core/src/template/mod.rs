//! Template rendering over the layered scope.

mod jinja;

pub use jinja::{contains_template_syntax, TemplateRenderer};
