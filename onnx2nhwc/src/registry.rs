//! Name -> tagged value bindings for one translation call.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::format::{DataFormat, Operand};

/// Where a registered value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    GraphInput,
    Initializer,
    /// Index of the source node that produced it.
    Node(usize),
}

#[derive(Debug, Clone)]
struct Entry {
    producer: Producer,
    operand: Operand,
}

#[derive(Debug, Default)]
pub struct TensorRegistry {
    entries: HashMap<String, Entry>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new name. Names are single-assignment.
    pub fn register(&mut self, name: &str, producer: Producer, operand: Operand) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(Error::MalformedGraph(format!(
                "tensor '{name}' is produced more than once"
            )));
        }
        log::trace!("register {name} as {}", operand.format());
        self.entries
            .insert(name.to_string(), Entry { producer, operand });
        Ok(())
    }

    /// Point an existing name at a converted copy of its value.
    pub fn rebind(&mut self, name: &str, operand: Operand) -> Result<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| unknown(name))?;
        entry.operand = operand;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&Operand> {
        self.entries
            .get(name)
            .map(|e| &e.operand)
            .ok_or_else(|| unknown(name))
    }

    pub fn format_of(&self, name: &str) -> Result<DataFormat> {
        self.lookup(name).map(Operand::format)
    }

    pub fn producer_of(&self, name: &str) -> Result<Producer> {
        self.entries
            .get(name)
            .map(|e| e.producer)
            .ok_or_else(|| unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unknown(name: &str) -> Error {
    Error::MalformedGraph(format!("reference to unknown tensor '{name}'"))
}
