// FLOWLINE — ELEMENT GRAPH
// Per-worker DAG of element instances. Built from the pipeline config,
// validated hard at build time: port arities, single wiring per output
// port, no cycles except through a scheduler-capable vertex. Each
// computation worker owns a private copy; the only cross-thread access is
// the init-phase ladder, serialized by the supervisor.

pub mod executor;

use std::collections::HashMap;

use crate::config::PipelineConfig;
use crate::element::{Element, ElementContext};
use crate::elements;
use crate::engine::nls::NodeLocalStorage;
use crate::{Error, Result};

pub struct Vertex {
    pub elem: Box<dyn Element>,
    pub name: String,
    /// One downstream (vertex, dst_port) per output port, or None.
    pub out_edges: Vec<Option<(usize, usize)>>,
    pub in_ports: usize,
    pub offloadable: bool,
    pub schedulable: bool,
    /// Terminal TX vertex: output port 0 means "to the NIC".
    pub is_tx_sink: bool,
}

pub struct ElementGraph {
    pub vertices: Vec<Vertex>,
    /// Source port → root vertex (a FromInput element).
    roots: HashMap<u16, usize>,
}

impl ElementGraph {
    pub fn build(pipeline: &PipelineConfig, ctx: &ElementContext) -> Result<Self> {
        let mut vertices = Vec::with_capacity(pipeline.nodes.len());
        let mut by_name = HashMap::new();

        for decl in &pipeline.nodes {
            let mut elem = elements::create(&decl.class)?;
            elem.configure(ctx, &decl.args)
                .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", decl.name)))?;
            let (in_ports, out_ports) = elem.port_count();
            let caps = elem.caps();
            let is_tx_sink = decl.class == "ToOutput";
            by_name.insert(decl.name.clone(), vertices.len());
            vertices.push(Vertex {
                name: decl.name.clone(),
                out_edges: vec![None; out_ports],
                in_ports,
                offloadable: caps.offloadable,
                schedulable: caps.schedulable,
                is_tx_sink,
                elem,
            });
        }

        for edge in &pipeline.edges {
            let &src = by_name.get(&edge.src).ok_or_else(|| {
                Error::ConfigInvalid(format!("edge references unknown element {:?}", edge.src))
            })?;
            let &dst = by_name.get(&edge.dst).ok_or_else(|| {
                Error::ConfigInvalid(format!("edge references unknown element {:?}", edge.dst))
            })?;
            if edge.src_port >= vertices[src].out_edges.len() {
                return Err(Error::ConfigInvalid(format!(
                    "{}[{}]: output port beyond declared arity {}",
                    edge.src,
                    edge.src_port,
                    vertices[src].out_edges.len()
                )));
            }
            if edge.dst_port >= vertices[dst].in_ports {
                return Err(Error::ConfigInvalid(format!(
                    "[{}]{}: input port beyond declared arity {}",
                    edge.dst_port, edge.dst, vertices[dst].in_ports
                )));
            }
            if vertices[src].out_edges[edge.src_port].is_some() {
                return Err(Error::ConfigInvalid(format!(
                    "{}[{}] wired twice",
                    edge.src, edge.src_port
                )));
            }
            vertices[src].out_edges[edge.src_port] = Some((dst, edge.dst_port));
        }

        // Every output port of a non-sink element must be wired.
        for v in &vertices {
            for (port, edge) in v.out_edges.iter().enumerate() {
                if edge.is_none() && !v.is_tx_sink {
                    return Err(Error::ConfigInvalid(format!(
                        "{}[{port}] left unconnected",
                        v.name
                    )));
                }
            }
        }

        let mut roots = HashMap::new();
        for (idx, decl) in pipeline.nodes.iter().enumerate() {
            if decl.class == "FromInput" {
                let port: u16 = decl
                    .args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .ok_or_else(|| Error::ConfigInvalid("FromInput without port".into()))?;
                if roots.insert(port, idx).is_some() {
                    return Err(Error::ConfigInvalid(format!(
                        "two FromInput elements claim source port {port}"
                    )));
                }
            }
        }
        if roots.is_empty() {
            return Err(Error::ConfigInvalid("pipeline has no FromInput root".into()));
        }

        let graph = ElementGraph { vertices, roots };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Plain edges must form a DAG; only scheduler-capable vertices may
    /// source a back-edge.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        fn visit(
            g: &ElementGraph,
            v: usize,
            marks: &mut [Mark],
        ) -> std::result::Result<(), String> {
            marks[v] = Mark::Grey;
            if !g.vertices[v].schedulable {
                for edge in g.vertices[v].out_edges.iter().flatten() {
                    let (dst, _) = *edge;
                    match marks[dst] {
                        Mark::Grey => {
                            return Err(format!(
                                "cycle through {:?} without a scheduler element",
                                g.vertices[dst].name
                            ))
                        }
                        Mark::White => visit(g, dst, marks)?,
                        Mark::Black => {}
                    }
                }
            }
            marks[v] = Mark::Black;
            Ok(())
        }
        let mut marks = vec![Mark::White; self.vertices.len()];
        for v in 0..self.vertices.len() {
            if marks[v] == Mark::White {
                visit(self, v, &mut marks).map_err(Error::ConfigInvalid)?;
            }
        }
        Ok(())
    }

    pub fn root_for(&self, source_port: u16) -> Option<usize> {
        self.roots.get(&source_port).copied()
    }

    pub fn downstream(&self, vertex: usize, out_port: usize) -> Option<(usize, usize)> {
        self.vertices[vertex].out_edges.get(out_port).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    // ------------------------------------------------------------------
    // Init ladder. Call order is enforced by the supervisor's barriers:
    // global → per-node → (offload init on the coproc worker) → per-thread
    // → bind_offload_devices → traffic.
    // ------------------------------------------------------------------

    pub fn init_global(&mut self) -> Result<()> {
        for v in &mut self.vertices {
            v.elem.initialize_global()?;
        }
        Ok(())
    }

    pub fn init_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        for v in &mut self.vertices {
            v.elem.initialize_per_node(nls)?;
        }
        Ok(())
    }

    pub fn init_per_thread(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        for v in &mut self.vertices {
            v.elem.initialize(nls)?;
        }
        Ok(())
    }

    /// Collect the offload-init closures of every offloadable vertex, for
    /// the owning coprocessor worker to run.
    pub fn offload_init_fns(&self) -> Vec<crate::element::OffloadInitFn> {
        self.vertices
            .iter()
            .filter_map(|v| v.elem.offload().and_then(|o| o.offload_init_fn()))
            .collect()
    }

    /// Per-thread device binding, after offload init published its handles.
    pub fn bind_offload_devices(
        &mut self,
        dev: &dyn crate::offload::device::ComputeDevice,
        nls: &NodeLocalStorage,
    ) -> Result<()> {
        for v in &mut self.vertices {
            if let Some(o) = v.elem.offload_mut() {
                o.bind_device(dev, nls)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pipeline;

    fn ctx() -> ElementContext {
        ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 2 }
    }

    #[test]
    fn builds_simple_chain() {
        let p = parse_pipeline("fi :: FromInput(0); d :: Discard(); fi -> d").unwrap();
        let g = ElementGraph::build(&p, &ctx()).unwrap();
        assert_eq!(g.len(), 2);
        let root = g.root_for(0).unwrap();
        assert_eq!(g.vertices[root].name, "fi");
        assert_eq!(g.downstream(root, 0), Some((1, 0)));
        assert!(g.root_for(1).is_none());
    }

    #[test]
    fn port_beyond_arity_is_config_error() {
        let p = parse_pipeline("fi :: FromInput(0); d :: Discard(); fi[3] -> d").unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_err());
    }

    #[test]
    fn double_wiring_rejected() {
        let p = parse_pipeline("fi :: FromInput(0); a :: Discard(); b :: Discard(); fi -> a; fi -> b")
            .unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_err());
    }

    #[test]
    fn unconnected_output_rejected() {
        let p = parse_pipeline("fi :: FromInput(0); fwd :: L2Forward(); fi -> fwd").unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_err());
    }

    #[test]
    fn plain_cycle_rejected_scheduler_cycle_allowed() {
        // fwd -> fwd2 -> fwd is a plain cycle.
        let p = parse_pipeline(
            "fi :: FromInput(0); a :: L2Forward(next=0); b :: L2Forward(next=0); fi -> a; a -> b; b -> a",
        )
        .unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_err());

        // Same loop broken by a Queue (schedulable) is legal.
        let p = parse_pipeline(
            "fi :: FromInput(0); a :: L2Forward(next=0); q :: Queue(); fi -> a; a -> q; q -> a",
        )
        .unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_ok());
    }

    #[test]
    fn duplicate_source_port_rejected() {
        let p = parse_pipeline(
            "a :: FromInput(0); b :: FromInput(0); x :: Discard(); y :: Discard(); a -> x; b -> y",
        )
        .unwrap();
        assert!(ElementGraph::build(&p, &ctx()).is_err());
    }

    #[test]
    fn tx_sink_flagged() {
        let p = parse_pipeline("fi :: FromInput(0); o :: ToOutput(1); fi -> o").unwrap();
        let g = ElementGraph::build(&p, &ctx()).unwrap();
        assert!(g.vertices[1].is_tx_sink);
        assert!(!g.vertices[0].is_tx_sink);
    }
}
