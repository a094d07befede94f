use std::fs;
use std::path::{Path, PathBuf};
use serde::Deserialize;

/*
Machine description
-------------------
A YAML file describing the machine to build: processor count, the physical
memory areas and the trace options. Example:

  cpus: 2
  nondet: false
  memory:
    - name: main
      start: 0x0
      size: 0x1000000
    - name: boot
      start: 0x1FC00000
      size: 0x400000
      writable: false
      image: firmware.bin
  trace:
    enabled: true
    iregch: true
    ireg: 2
*/

fn default_cpus() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    #[serde(default = "default_cpus")]
    pub cpus: usize,
    #[serde(default)]
    pub memory: Vec<MemAreaConfig>,
    #[serde(default)]
    pub trace: TraceConfig,
    /// Allow devices that observe host time or randomness.
    #[serde(default)]
    pub nondet: bool,
    /// Stop after this many machine cycles.
    #[serde(default)]
    pub steps: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemAreaConfig {
    pub name: String,
    pub start: u64,
    /// Size of a generic area; ignored for file-mapped areas.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default = "default_true")]
    pub writable: bool,
    /// File image loaded at the start of the area.
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Byte value the area is filled with before any image load.
    #[serde(default)]
    pub fill: Option<u8>,
    /// File-backed area; the size is the file length.
    #[serde(default)]
    pub fmap: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Append the modified-register diff to each trace line.
    #[serde(default)]
    pub iregch: bool,
    /// Register naming: 0 = r0.., 1 = $0.., 2 = ABI names.
    #[serde(default)]
    pub ireg: u32,
}

impl Default for MachineConfig {
    /// One processor, 16M of RAM and 4M of boot memory under the reset
    /// vector.
    fn default() -> Self {
        MachineConfig {
            cpus: 1,
            memory: vec![
                MemAreaConfig {
                    name: "main".to_string(),
                    start: 0x0,
                    size: Some(0x100_0000),
                    writable: true,
                    image: None,
                    fill: None,
                    fmap: None,
                },
                MemAreaConfig {
                    name: "boot".to_string(),
                    start: 0x1FC0_0000,
                    size: Some(0x40_0000),
                    writable: true,
                    image: None,
                    fill: None,
                    fmap: None,
                },
            ],
            trace: TraceConfig::default(),
            nondet: false,
            steps: None,
        }
    }
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read configuration {}: {}", path.display(), e))?;
        serde_yaml::from_str(&text)
            .map_err(|e| format!("Invalid configuration {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_description() {
        let text = r#"
cpus: 2
nondet: true
steps: 1000
memory:
  - name: main
    start: 0x0
    size: 0x100000
  - name: boot
    start: 0x1FC00000
    size: 0x4000
    writable: false
trace:
  enabled: true
  iregch: true
  ireg: 2
"#;
        let config: MachineConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(config.cpus, 2);
        assert!(config.nondet);
        assert_eq!(config.steps, Some(1000));
        assert_eq!(config.memory.len(), 2);
        assert_eq!(config.memory[1].start, 0x1FC0_0000);
        assert!(!config.memory[1].writable);
        assert!(config.trace.enabled);
        assert_eq!(config.trace.ireg, 2);
    }

    #[test]
    fn defaults_apply() {
        let config: MachineConfig = serde_yaml::from_str("memory: []").unwrap();
        assert_eq!(config.cpus, 1);
        assert!(!config.nondet);
        assert!(config.memory.is_empty());
        assert!(!config.trace.enabled);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<MachineConfig, _> = serde_yaml::from_str("cpu_count: 4");
        assert!(result.is_err());
    }
}
