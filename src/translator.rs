/*!
 * @file translator.rs
 * @brief Public translator façade
 */

use bson::{Bson, Document};

use crate::config::{TranslateOptions, TranslatorConfig};
use crate::context::GenerationContext;
use crate::error::{MongoraError, Result};
use crate::mongora_debug;
use crate::pipeline::Pipeline;
use crate::renderer::render_pipeline;
use crate::stage_parser::StageParser;

/// One translated statement: the SQL text and its bind values, in
/// placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub sql: String,
    pub binds: Vec<Bson>,
}

/// Stateless translator bound to one collection configuration. Holds no
/// per-call state, so a single instance may serve concurrent calls.
#[derive(Debug)]
pub struct Translator {
    config: TranslatorConfig,
    options: TranslateOptions,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            options: TranslateOptions::default(),
        })
    }

    pub fn with_options(mut self, options: TranslateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Parses stage documents into a pipeline without rendering.
    pub fn parse(&self, stage_docs: &[Document]) -> Result<Pipeline> {
        let stages = StageParser::parse_pipeline(stage_docs)?;
        Ok(Pipeline::new(self.config.collection.clone(), stages))
    }

    pub fn translate(&self, stage_docs: &[Document]) -> Result<Translation> {
        let pipeline = self.parse(stage_docs)?;
        self.translate_pipeline(&pipeline)
    }

    /// Renders an already-parsed (possibly optimiser-rewritten) pipeline.
    pub fn translate_pipeline(&self, pipeline: &Pipeline) -> Result<Translation> {
        mongora_debug!(
            "translating {} stage(s) against {}",
            pipeline.stages().len(),
            pipeline.collection()
        );
        let mut ctx = GenerationContext::new(&self.config, &self.options);
        render_pipeline(pipeline, &mut ctx)?;
        let (sql, binds) = ctx.finish();

        if !self.options.inline_binds {
            verify_bind_alignment(&sql, binds.len())?;
        }
        Ok(Translation { sql, binds })
    }
}

/// Placeholder indices in the SQL must be exactly {1..N} for N bind
/// values.
fn verify_bind_alignment(sql: &str, bind_count: usize) -> Result<()> {
    let mut indices = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                let index: usize = sql[start..end].parse().unwrap_or(0);
                indices.push(index);
                i = end;
                continue;
            }
        }
        i += 1;
    }
    indices.sort_unstable();
    let aligned = indices.len() == bind_count && indices.iter().enumerate().all(|(i, n)| *n == i + 1);
    if aligned {
        Ok(())
    } else {
        Err(MongoraError::translation(format!(
            "bind placeholder mismatch: {} placeholders for {} values",
            indices.len(),
            bind_count
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn translator_is_reusable_and_deterministic() {
        let translator = Translator::new(TranslatorConfig::new("orders")).unwrap();
        let stages = vec![doc! { "$match": { "status": "completed" } }];
        let first = translator.translate(&stages).unwrap();
        let second = translator.translate(&stages).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bind_alignment_is_verified() {
        assert!(verify_bind_alignment("SELECT :1, :2", 2).is_ok());
        assert!(verify_bind_alignment("SELECT :1, :3", 2).is_err());
        assert!(verify_bind_alignment("SELECT 1", 1).is_err());
        assert!(verify_bind_alignment("SELECT 1", 0).is_ok());
    }

    #[test]
    fn config_identifiers_validated_at_construction() {
        assert!(Translator::new(TranslatorConfig::new("bad name")).is_err());
    }
}
