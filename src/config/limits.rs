//! Resource grant configuration.
//!
//! Limits arrive either as the classic line-oriented grant file written by a
//! node manager (`resource <name> <value>`, one grant per line) or as JSON
//! with the same structure. `cpu`, `memory`, and `diskused` must be granted
//! explicitly; a sandbox with no ceiling on any of those is a configuration
//! bug, not a permissive default.

use crate::config::types::{Fungible, PortResource, Renewable, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// The complete set of ceilings for one sandbox.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Renewable drain rates in units per second. `cpu` is a fraction of one
    /// core and is enforced by the process monitor, not by ledger charges.
    pub renewable: HashMap<Renewable, f64>,
    /// Item caps (open sockets, open files, in-flight events).
    pub fungible: HashMap<Fungible, u64>,
    /// Port allow-sets for message and connection traffic.
    pub ports: HashMap<PortResource, BTreeSet<u16>>,
    /// Resident memory ceiling in bytes (hard kill).
    pub memory: u64,
    /// On-disk usage ceiling in bytes (hard kill).
    pub diskused: u64,
}

impl ResourceLimits {
    /// Parse the line-oriented grant format. `call ...` lines belong to the
    /// static safety checker and are skipped here.
    pub fn parse(text: &str) -> Result<ResourceLimits> {
        let mut limits = ResourceLimits::default();
        let mut saw_memory = false;
        let mut saw_disk = false;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("call") => continue,
                Some("resource") => {}
                Some(other) => {
                    return Err(SandboxError::Config(format!(
                        "line {}: unknown directive '{}'",
                        lineno + 1,
                        other
                    )));
                }
                None => continue,
            }

            let name = fields.next().ok_or_else(|| {
                SandboxError::Config(format!("line {}: resource grant missing a name", lineno + 1))
            })?;
            let value = fields.next().ok_or_else(|| {
                SandboxError::Config(format!(
                    "line {}: resource '{}' missing a value",
                    lineno + 1,
                    name
                ))
            })?;

            if let Some(port_resource) = PortResource::from_name(name) {
                let port: u16 = value.parse().map_err(|_| {
                    SandboxError::Config(format!(
                        "line {}: bad port '{}' for '{}'",
                        lineno + 1,
                        value,
                        name
                    ))
                })?;
                if port == 0 {
                    return Err(SandboxError::Config(format!(
                        "line {}: port 0 cannot be granted",
                        lineno + 1
                    )));
                }
                limits.ports.entry(port_resource).or_default().insert(port);
            } else if let Some(fungible) = Fungible::from_name(name) {
                let cap: u64 = value.parse().map_err(|_| {
                    SandboxError::Config(format!(
                        "line {}: bad count '{}' for '{}'",
                        lineno + 1,
                        value,
                        name
                    ))
                })?;
                limits.fungible.insert(fungible, cap);
            } else if let Some(renewable) = Renewable::from_name(name) {
                let rate = parse_rate(value, lineno, name)?;
                limits.renewable.insert(renewable, rate);
            } else if name == "memory" {
                limits.memory = value.parse().map_err(|_| {
                    SandboxError::Config(format!("line {}: bad memory grant '{}'", lineno + 1, value))
                })?;
                saw_memory = true;
            } else if name == "diskused" {
                limits.diskused = value.parse().map_err(|_| {
                    SandboxError::Config(format!("line {}: bad disk grant '{}'", lineno + 1, value))
                })?;
                saw_disk = true;
            } else {
                return Err(SandboxError::Config(format!(
                    "line {}: unknown resource '{}'",
                    lineno + 1,
                    name
                )));
            }
        }

        limits.validate(saw_memory, saw_disk)?;
        Ok(limits)
    }

    /// Parse a grant file from disk; the JSON form is accepted as well.
    pub fn load(path: &Path) -> Result<ResourceLimits> {
        let text = std::fs::read_to_string(path)?;
        if text.trim_start().starts_with('{') {
            let limits: ResourceLimits = serde_json::from_str(&text)
                .map_err(|e| SandboxError::Config(format!("bad JSON grant file: {}", e)))?;
            limits.validate(true, true)?;
            return Ok(limits);
        }
        ResourceLimits::parse(&text)
    }

    fn validate(&self, saw_memory: bool, saw_disk: bool) -> Result<()> {
        if !self.renewable.contains_key(&Renewable::Cpu) {
            return Err(SandboxError::Config(
                "mandatory resource 'cpu' was never granted".to_string(),
            ));
        }
        if !saw_memory || self.memory == 0 {
            return Err(SandboxError::Config(
                "mandatory resource 'memory' was never granted".to_string(),
            ));
        }
        if !saw_disk || self.diskused == 0 {
            return Err(SandboxError::Config(
                "mandatory resource 'diskused' was never granted".to_string(),
            ));
        }
        for (resource, rate) in &self.renewable {
            if !rate.is_finite() || *rate < 0.0 {
                return Err(SandboxError::Config(format!(
                    "resource '{}' has an invalid rate {}",
                    resource, rate
                )));
            }
        }
        Ok(())
    }

    pub fn renewable_rate(&self, resource: Renewable) -> f64 {
        self.renewable.get(&resource).copied().unwrap_or(0.0)
    }

    pub fn fungible_cap(&self, resource: Fungible) -> u64 {
        self.fungible.get(&resource).copied().unwrap_or(0)
    }

    pub fn allowed_ports(&self, resource: PortResource) -> BTreeSet<u16> {
        self.ports.get(&resource).cloned().unwrap_or_default()
    }

    /// CPU ceiling as a fraction of one core.
    pub fn cpu_fraction(&self) -> f64 {
        self.renewable_rate(Renewable::Cpu)
    }
}

fn parse_rate(value: &str, lineno: usize, name: &str) -> Result<f64> {
    value.parse().map_err(|_| {
        SandboxError::Config(format!(
            "line {}: bad rate '{}' for '{}'",
            lineno + 1,
            value,
            name
        ))
    })
}
