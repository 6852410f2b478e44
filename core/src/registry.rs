//! The model registry: validated model descriptors, looked up by name.

use crate::{Error, ErrorKind, Result};
use dataflow_model::ModelDescriptor;
use indexmap::IndexMap;
use parking_lot::RwLock;

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<IndexMap<String, ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a model. Re-registering a name is a
    /// configuration error, not an update.
    pub fn register(&self, mut model: ModelDescriptor) -> Result<()> {
        model.validate()?;

        let mut models = self.models.write();
        if models.contains_key(&model.name) {
            return Err(Error::validation(format!(
                "model `{}` is already registered",
                model.name
            )));
        }

        models.insert(model.name.clone(), model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ModelDescriptor> {
        self.models.read().get(name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::UnknownModel {
                name: name.to_owned(),
                available: self.names(),
            })
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<ModelDescriptor> {
        self.models.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Cross-model validation run before SQL or migrations are generated:
    /// every foreign key must point at a registered model and an existing
    /// field.
    pub fn check_references(&self) -> Result<()> {
        let models = self.models.read();

        for model in models.values() {
            for field in model.fields.values() {
                let Some(reference) = &field.references else { continue };

                let Some(target) = models.get(&reference.model) else {
                    return Err(Error::validation(format!(
                        "field `{}.{}` references unregistered model `{}`",
                        model.name, field.name, reference.model
                    )));
                };

                if target.field_named(&reference.field).is_none() {
                    return Err(Error::validation(format!(
                        "field `{}.{}` references `{}.{}`, which does not exist",
                        model.name, field.name, reference.model, reference.field
                    )));
                }
            }
        }

        Ok(())
    }
}
