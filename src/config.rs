// FLOWLINE — CONFIGURATION
// Two inputs: the system parameter file (TOML — queue lengths, batch sizes,
// pool sizes, the thread→core map and which rings to wire) and the pipeline
// file (the element graph DSL: `name :: Class(args…)` declarations and
// `a[port] -> [port]b` edges, with `->` chains).

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result, MAX_COMP_BATCH_SIZE, MAX_PORTS};

// ============================================================================
// SYSTEM PARAMETERS
// ============================================================================

fn d_num_rxq_per_port() -> usize { 1 }
fn d_io_desc_per_hwrxq() -> usize { 1024 }
fn d_io_desc_per_hwtxq() -> usize { 1024 }
fn d_io_batch_size() -> usize { 32 }
fn d_comp_batch_size() -> usize { 64 }
fn d_coproc_ppdepth() -> usize { 32 }
fn d_coproc_inputq_length() -> usize { 256 }
fn d_coproc_completionq_length() -> usize { 256 }
fn d_coproc_ctx_per_compthread() -> usize { 2 }
fn d_batchpool_size() -> usize { 512 }
fn d_taskpool_size() -> usize { 256 }
fn d_io_rxq_length() -> usize { 32 }

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemParams {
    #[serde(rename = "NUM_RXQ_PER_PORT", default = "d_num_rxq_per_port")]
    pub num_rxq_per_port: usize,
    #[serde(rename = "IO_DESC_PER_HWRXQ", default = "d_io_desc_per_hwrxq")]
    pub io_desc_per_hwrxq: usize,
    #[serde(rename = "IO_DESC_PER_HWTXQ", default = "d_io_desc_per_hwtxq")]
    pub io_desc_per_hwtxq: usize,
    #[serde(rename = "IO_BATCH_SIZE", default = "d_io_batch_size")]
    pub io_batch_size: usize,
    #[serde(rename = "COMP_BATCH_SIZE", default = "d_comp_batch_size")]
    pub comp_batch_size: usize,
    #[serde(rename = "COPROC_PPDEPTH", default = "d_coproc_ppdepth")]
    pub coproc_ppdepth: usize,
    #[serde(rename = "COPROC_INPUTQ_LENGTH", default = "d_coproc_inputq_length")]
    pub coproc_inputq_length: usize,
    #[serde(rename = "COPROC_COMPLETIONQ_LENGTH", default = "d_coproc_completionq_length")]
    pub coproc_completionq_length: usize,
    #[serde(rename = "COPROC_CTX_PER_COMPTHREAD", default = "d_coproc_ctx_per_compthread")]
    pub coproc_ctx_per_compthread: usize,
    #[serde(rename = "BATCHPOOL_SIZE", default = "d_batchpool_size")]
    pub batchpool_size: usize,
    #[serde(rename = "TASKPOOL_SIZE", default = "d_taskpool_size")]
    pub taskpool_size: usize,
    /// Software RX handoff ring length (io → comp).
    #[serde(rename = "IO_RXQ_LENGTH", default = "d_io_rxq_length")]
    pub io_rxq_length: usize,
}

impl Default for SystemParams {
    fn default() -> Self {
        // serde's defaults are the single source of truth.
        toml::from_str("").expect("empty params deserialize")
    }
}

impl SystemParams {
    pub fn validate(&self) -> Result<()> {
        if self.comp_batch_size == 0 || self.comp_batch_size > MAX_COMP_BATCH_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "COMP_BATCH_SIZE must be in 1..={MAX_COMP_BATCH_SIZE}"
            )));
        }
        if self.io_batch_size == 0 {
            return Err(Error::ConfigInvalid("IO_BATCH_SIZE must be > 0".into()));
        }
        if self.batchpool_size == 0 || self.taskpool_size == 0 {
            return Err(Error::ConfigInvalid(
                "BATCHPOOL_SIZE and TASKPOOL_SIZE must be > 0".into(),
            ));
        }
        if self.coproc_ppdepth == 0 {
            return Err(Error::ConfigInvalid("COPROC_PPDEPTH must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// THREAD / RING WIRING
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoThreadConf {
    pub core: usize,
    /// Owned hardware RX queues as (port, queue) pairs.
    pub rxqs: Vec<(usize, usize)>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompThreadConf {
    pub core: usize,
}

fn d_device() -> String {
    "host".into()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoprocThreadConf {
    pub core: usize,
    #[serde(default = "d_device")]
    pub device: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadsConf {
    #[serde(default)]
    pub io: Vec<IoThreadConf>,
    #[serde(default)]
    pub comp: Vec<CompThreadConf>,
    #[serde(default)]
    pub coproc: Vec<CoprocThreadConf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default)]
    pub system: Option<SystemParams>,
    #[serde(default)]
    pub threads: ThreadsConf,
    /// NIC port count presented by the driver layer.
    #[serde(default = "d_num_ports")]
    pub num_ports: usize,
}

fn d_num_ports() -> usize {
    1
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigIo { path: path.to_path_buf(), source: e })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: SystemConfig =
            toml::from_str(text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn params(&self) -> SystemParams {
        self.system.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        let params = self.params();
        params.validate()?;
        if self.num_ports == 0 || self.num_ports > MAX_PORTS {
            return Err(Error::ConfigInvalid(format!("num_ports must be in 1..={MAX_PORTS}")));
        }
        if self.threads.io.is_empty() || self.threads.comp.is_empty() {
            return Err(Error::ConfigInvalid(
                "at least one io thread and one comp thread required".into(),
            ));
        }
        // Pairing is static 1:1 by index.
        if self.threads.io.len() != self.threads.comp.len() {
            return Err(Error::ConfigInvalid(format!(
                "io/comp thread counts must match 1:1 ({} vs {})",
                self.threads.io.len(),
                self.threads.comp.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for io in &self.threads.io {
            if io.rxqs.is_empty() {
                return Err(Error::ConfigInvalid("io thread owns no RX queues".into()));
            }
            for &(port, queue) in &io.rxqs {
                if port >= self.num_ports {
                    return Err(Error::ConfigInvalid(format!("rxq port {port} out of range")));
                }
                if queue >= params.num_rxq_per_port {
                    return Err(Error::ConfigInvalid(format!(
                        "rxq queue {queue} out of range (NUM_RXQ_PER_PORT={})",
                        params.num_rxq_per_port
                    )));
                }
                if !seen.insert((port, queue)) {
                    return Err(Error::ConfigInvalid(format!(
                        "rxq ({port},{queue}) owned by two io threads"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// PIPELINE DSL
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDecl {
    pub name: String,
    pub class: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeDecl {
    pub src: String,
    pub src_port: usize,
    pub dst: String,
    pub dst_port: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub nodes: Vec<NodeDecl>,
    pub edges: Vec<EdgeDecl>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigIo { path: path.to_path_buf(), source: e })?;
        parse_pipeline(&text)
    }
}

fn strip_comment(line: &str) -> &str {
    let line = line.split('#').next().unwrap_or("");
    line.split("//").next().unwrap_or("")
}

fn parse_decl(stmt: &str) -> Result<NodeDecl> {
    let (name, rest) = stmt.split_once("::").expect("caller checked");
    let name = name.trim();
    let rest = rest.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(Error::ConfigInvalid(format!("bad element name {name:?}")));
    }
    let (class, args) = match rest.split_once('(') {
        Some((class, tail)) => {
            let inner = tail
                .strip_suffix(')')
                .ok_or_else(|| Error::ConfigInvalid(format!("unclosed args in {stmt:?}")))?;
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|a| a.trim().to_string()).collect()
            };
            (class.trim().to_string(), args)
        }
        None => (rest.to_string(), Vec::new()),
    };
    if class.is_empty() {
        return Err(Error::ConfigInvalid(format!("missing class in {stmt:?}")));
    }
    Ok(NodeDecl { name: name.to_string(), class, args })
}

/// One `->` chain segment: `[in]name[out]`, both ports optional (default 0).
fn parse_segment(seg: &str) -> Result<(usize, String, usize)> {
    let seg = seg.trim();
    let (in_port, rest) = if let Some(tail) = seg.strip_prefix('[') {
        let (port, rest) = tail
            .split_once(']')
            .ok_or_else(|| Error::ConfigInvalid(format!("bad port syntax in {seg:?}")))?;
        let p = port
            .trim()
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("bad port number in {seg:?}")))?;
        (p, rest.trim())
    } else {
        (0, seg)
    };
    let (name, out_port) = if let Some((name, tail)) = rest.split_once('[') {
        let port = tail
            .strip_suffix(']')
            .ok_or_else(|| Error::ConfigInvalid(format!("bad port syntax in {seg:?}")))?;
        let p = port
            .trim()
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("bad port number in {seg:?}")))?;
        (name.trim(), p)
    } else {
        (rest, 0)
    };
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(Error::ConfigInvalid(format!("bad element reference {seg:?}")));
    }
    Ok((in_port, name.to_string(), out_port))
}

pub fn parse_pipeline(text: &str) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::default();
    let cleaned: String = text.lines().map(strip_comment).collect::<Vec<_>>().join("\n");

    for stmt in cleaned.split(&[';', '\n']) {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        if stmt.contains("::") {
            let decl = parse_decl(stmt)?;
            if cfg.nodes.iter().any(|n| n.name == decl.name) {
                return Err(Error::ConfigInvalid(format!(
                    "element {:?} declared twice",
                    decl.name
                )));
            }
            cfg.nodes.push(decl);
        } else if stmt.contains("->") {
            let segments: Vec<_> = stmt.split("->").collect();
            let mut prev: Option<(String, usize)> = None;
            for seg in segments {
                let (in_port, name, out_port) = parse_segment(seg)?;
                if let Some((src, src_port)) = prev.take() {
                    cfg.edges.push(EdgeDecl {
                        src,
                        src_port,
                        dst: name.clone(),
                        dst_port: in_port,
                    });
                }
                prev = Some((name, out_port));
            }
        } else {
            return Err(Error::ConfigInvalid(format!("unparsable statement {stmt:?}")));
        }
    }
    if cfg.nodes.is_empty() {
        return Err(Error::ConfigInvalid("pipeline declares no elements".into()));
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = SystemParams::default();
        assert_eq!(p.comp_batch_size, 64);
        assert_eq!(p.io_rxq_length, 32);
        assert_eq!(p.coproc_ppdepth, 32);
        p.validate().unwrap();
    }

    #[test]
    fn system_config_parses_and_validates() {
        let cfg = SystemConfig::parse(
            r#"
            num_ports = 2

            [system]
            COMP_BATCH_SIZE = 32
            COPROC_INPUTQ_LENGTH = 128

            [[threads.io]]
            core = 0
            rxqs = [[0, 0], [1, 0]]

            [[threads.comp]]
            core = 1

            [[threads.coproc]]
            core = 2
            device = "host"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.params().comp_batch_size, 32);
        assert_eq!(cfg.threads.coproc[0].device, "host");
    }

    #[test]
    fn unknown_key_rejected() {
        let err = SystemConfig::parse(
            r#"
            [system]
            COMP_BATCH_SIZZLE = 32
            [[threads.io]]
            core = 0
            rxqs = [[0,0]]
            [[threads.comp]]
            core = 1
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_rxq_rejected() {
        let err = SystemConfig::parse(
            r#"
            [[threads.io]]
            core = 0
            rxqs = [[0,0]]
            [[threads.io]]
            core = 2
            rxqs = [[0,0]]
            [[threads.comp]]
            core = 1
            [[threads.comp]]
            core = 3
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn mismatched_pairing_rejected() {
        let err = SystemConfig::parse(
            r#"
            [[threads.io]]
            core = 0
            rxqs = [[0,0]]
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn pipeline_decls_and_edges() {
        let cfg = parse_pipeline(
            r#"
            # ingress
            fi :: FromInput(0);
            fwd :: L2Forward(next=1);
            out :: ToOutput();
            fi[0] -> [0]fwd -> out;
            "#,
        )
        .unwrap();
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.nodes[1].args, vec!["next=1"]);
        assert_eq!(cfg.edges.len(), 2);
        assert_eq!(
            cfg.edges[0],
            EdgeDecl { src: "fi".into(), src_port: 0, dst: "fwd".into(), dst_port: 0 }
        );
        assert_eq!(
            cfg.edges[1],
            EdgeDecl { src: "fwd".into(), src_port: 0, dst: "out".into(), dst_port: 0 }
        );
    }

    #[test]
    fn pipeline_explicit_ports() {
        let cfg = parse_pipeline("a :: FromInput(0)\nb :: Discard\na[0] -> [0]b").unwrap();
        assert_eq!(cfg.edges.len(), 1);
    }

    #[test]
    fn pipeline_rejects_garbage() {
        assert!(parse_pipeline("a :: FromInput(0\n").is_err());
        assert!(parse_pipeline("what is this").is_err());
        assert!(parse_pipeline("a :: X; a :: Y").is_err());
    }
}
