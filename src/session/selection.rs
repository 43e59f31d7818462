//! Tool selection state with exclusive-server semantics

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A resolved selection entry: a whole server or one of its tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTarget {
    pub server: String,
    pub tool: Option<String>,
    pub exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFilter {
    All,
    Only(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSelection {
    pub exclusive: bool,
    pub tools: ToolFilter,
}

/// Selected tool servers for a session
///
/// An exclusive server is never selected alongside any other server:
/// choosing it clears the rest, and choosing anything else drops it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ToolSelection {
    servers: BTreeMap<String, ServerSelection>,
}

impl ToolSelection {
    pub fn select(&mut self, target: SelectionTarget) {
        if target.exclusive {
            self.servers.retain(|name, _| *name == target.server);
        } else {
            self.servers
                .retain(|name, entry| !entry.exclusive || *name == target.server);
        }

        let entry = self
            .servers
            .entry(target.server)
            .or_insert_with(|| ServerSelection {
                exclusive: target.exclusive,
                tools: ToolFilter::Only(BTreeSet::new()),
            });
        entry.exclusive = target.exclusive;
        match target.tool {
            None => entry.tools = ToolFilter::All,
            Some(tool) => {
                if let ToolFilter::Only(tools) = &mut entry.tools {
                    tools.insert(tool);
                }
            }
        }
    }

    /// Replace the whole selection, applying entries in order
    pub fn replace(&mut self, targets: impl IntoIterator<Item = SelectionTarget>) {
        self.servers.clear();
        for target in targets {
            self.select(target);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> impl Iterator<Item = (&str, &ServerSelection)> {
        self.servers.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Whether `tool` on `server` may be offered to the model
    pub fn allows(&self, server: &str, tool: &str) -> bool {
        match self.servers.get(server).map(|entry| &entry.tools) {
            Some(ToolFilter::All) => true,
            Some(ToolFilter::Only(tools)) => tools.contains(tool),
            None => false,
        }
    }
}
