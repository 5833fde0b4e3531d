//! The result store: an ordered, name-keyed collection of layers.
//!
//! Every mutation is announced to subscribed [`LayerObserver`]s. The store
//! itself has no notion of a display; a viewer is just one more observer.

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{Layer, LayerData, LayerKind};

/// Change notification emitted after a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerEvent<'a> {
    /// A layer was added.
    Created(&'a Layer),
    /// A layer's data changed in place.
    Updated(&'a Layer),
    /// A layer was removed.
    Deleted(&'a str),
    /// A layer was renamed.
    Renamed {
        /// Previous name.
        from: &'a str,
        /// New name.
        to: &'a str,
    },
}

/// Receives [`LayerEvent`]s from a [`ResultStore`].
pub trait LayerObserver {
    /// Called once per mutation, after it took effect.
    fn on_event(&mut self, event: &LayerEvent<'_>);
}

impl<F> LayerObserver for F
where
    F: FnMut(&LayerEvent<'_>),
{
    fn on_event(&mut self, event: &LayerEvent<'_>) {
        self(event);
    }
}

/// Handle returned by [`ResultStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered collection of [`Layer`]s with unique names.
#[derive(Default)]
pub struct ResultStore {
    layers: Vec<Layer>,
    observers: Vec<(ObserverId, Box<dyn LayerObserver>)>,
    next_observer: u64,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("layers", &self.names().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn emit(observers: &mut [(ObserverId, Box<dyn LayerObserver>)], event: &LayerEvent<'_>) {
    for (_, observer) in observers {
        observer.on_event(event);
    }
}

impl ResultStore {
    /// Empty store with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for all future mutations.
    pub fn subscribe(&mut self, observer: Box<dyn LayerObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(other, _)| *other != id);
        self.observers.len() != before
    }

    /// Add a new layer.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateName`] if `name` is taken,
    /// [`StoreError::KindMismatch`] if `kind` cannot hold `data`.
    pub fn create(
        &mut self,
        kind: LayerKind,
        data: LayerData,
        name: impl Into<String>,
        meta: Map<String, Value>,
    ) -> Result<&Layer, StoreError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(StoreError::DuplicateName(name));
        }
        if !kind.accepts(&data) {
            return Err(StoreError::KindMismatch {
                name,
                kind,
                data: data.describe(),
            });
        }
        tracing::debug!(name = %name, kind = %kind, "layer created");
        self.layers.push(Layer {
            name,
            kind,
            data,
            meta,
        });
        let index = self.layers.len() - 1;
        emit(&mut self.observers, &LayerEvent::Created(&self.layers[index]));
        Ok(&self.layers[index])
    }

    /// Look up a layer by name.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no layer has this name.
    pub fn read(&self, name: &str) -> Result<&Layer, StoreError> {
        self.layers
            .iter()
            .find(|layer| layer.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    /// Replace a layer's data, keeping its identity and metadata.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::KindMismatch`].
    pub fn update(&mut self, name: &str, data: LayerData) -> Result<(), StoreError> {
        let index = self.index_of(name)?;
        let layer = &mut self.layers[index];
        if !layer.kind.accepts(&data) {
            return Err(StoreError::KindMismatch {
                name: name.to_owned(),
                kind: layer.kind,
                data: data.describe(),
            });
        }
        layer.data = data;
        emit(&mut self.observers, &LayerEvent::Updated(&self.layers[index]));
        Ok(())
    }

    /// Mutate a layer's data in place.
    ///
    /// `Updated` is emitted only if `f` succeeds. `f` must leave the data
    /// in a variant the layer kind accepts.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] (converted into `E`), or whatever `f`
    /// returns.
    pub fn update_with<R, E>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut LayerData) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let index = self.index_of(name)?;
        let out = f(&mut self.layers[index].data)?;
        emit(&mut self.observers, &LayerEvent::Updated(&self.layers[index]));
        Ok(out)
    }

    /// Remove a layer and return it.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no layer has this name.
    pub fn delete(&mut self, name: &str) -> Result<Layer, StoreError> {
        let index = self.index_of(name)?;
        let layer = self.layers.remove(index);
        tracing::debug!(name = %layer.name, "layer deleted");
        emit(&mut self.observers, &LayerEvent::Deleted(&layer.name));
        Ok(layer)
    }

    /// Give a layer a new name.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if `from` is missing,
    /// [`StoreError::DuplicateName`] if `to` is taken by another layer.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> Result<(), StoreError> {
        let to = to.into();
        let index = self.index_of(from)?;
        if from == to {
            return Ok(());
        }
        if self.contains(&to) {
            return Err(StoreError::DuplicateName(to));
        }
        let previous = std::mem::replace(&mut self.layers[index].name, to);
        emit(
            &mut self.observers,
            &LayerEvent::Renamed {
                from: &previous,
                to: &self.layers[index].name,
            },
        );
        Ok(())
    }

    /// Whether a layer with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.layers.iter().any(|layer| layer.name == name)
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if the store holds no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|layer| layer.name.as_str())
    }

    /// Layers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    fn index_of(&self, name: &str) -> Result<usize, StoreError> {
        self.layers
            .iter()
            .position(|layer| layer.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }
}

impl<'a> IntoIterator for &'a ResultStore {
    type Item = &'a Layer;
    type IntoIter = std::slice::Iter<'a, Layer>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}
