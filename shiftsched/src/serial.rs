//! The persisted form of a [Graph].
//!
//! ```json
//! {"ops":    [{"address": 0, "debugString": "a", "fwdLink": -1, "outs": [1], "allocs": [0]}, ...],
//!  "allocs": [{"address": 0, "weight": [0, 0, 0, 4.5, 0, 0, 0]}, ...]}
//! ```
//!
//! `fwdLink` is `-1` when the op has no forward link.

use std::fs::File;

use crate::helpe::*;
use crate::weight::N_SLOTS;
use crate::algo::RotationOutcome;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct OpRecord {
    address:        usize,
    debug_string:   String,
    fwd_link:       i64,
    outs:           Vec<usize>,
    allocs:         Vec<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct AllocRecord {
    address:    usize,
    weight:     Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct GraphRecord {
    ops:    Vec<OpRecord>,
    allocs: Vec<AllocRecord>,
}

/// Checks that `addresses` is a permutation of `0..addresses.len()`.
fn check_addresses(addresses: impl Iterator<Item = usize>, n: usize, what: &str) -> ShiftResult<()> {
    let mut seen = vec![false; n];
    for a in addresses {
        if a >= n {
            return Err(ShiftError::Parse(format!(
                "{} address {} is out of range, there are {} {}s", what, a, n, what
            )));
        }
        if seen[a] {
            return Err(ShiftError::Parse(format!("{} address {} is not unique", what, a)));
        }
        seen[a] = true;
    }

    Ok(())
}

impl GraphRecord {
    fn from_graph(g: &Graph) -> Self {
        Self {
            ops:    g.ops().iter()
                .map(|op| OpRecord {
                    address:        op.address().0,
                    debug_string:   op.debug_name().to_string(),
                    fwd_link:       op.fwd_link().map_or(-1, |l| l.0 as i64),
                    outs:           op.outs().iter().map(|o| o.0).collect(),
                    allocs:         op.allocs().iter().map(|a| a.0).collect(),
                })
                .collect(),
            allocs: g.allocs().iter()
                .map(|a| AllocRecord {
                    address:    a.address().0,
                    weight:     a.weight().slots().to_vec(),
                })
                .collect(),
        }
    }

    fn into_graph(mut self) -> ShiftResult<Graph> {
        let (n_ops, n_allocs) = (self.ops.len(), self.allocs.len());
        check_addresses(self.ops.iter().map(|o| o.address), n_ops, "op")?;
        check_addresses(self.allocs.iter().map(|a| a.address), n_allocs, "alloc")?;
        self.ops.sort_by_key(|o| o.address);
        self.allocs.sort_by_key(|a| a.address);

        let mut g = Graph::new();
        for op in &self.ops {
            g.insert_op(&op.debug_string);
        }
        for alloc in &self.allocs {
            let slots: [f64; N_SLOTS] = alloc.weight.as_slice().try_into().map_err(|_| {
                ShiftError::Parse(format!(
                    "weight of alloc {} has {} entries, expected {}",
                    alloc.address, alloc.weight.len(), N_SLOTS
                ))
            })?;
            g.insert_alloc(AllocWeight::from_slots(slots));
        }
        for op in &self.ops {
            let from = OpAddress(op.address);
            for &to in &op.outs {
                if to >= n_ops {
                    return Err(ShiftError::Parse(format!(
                        "out {} of op {} is out of range", to, op.address
                    )));
                }
                g.insert_constraint(from, OpAddress(to))
                    .map_err(|e| ShiftError::Parse(format!("outs of op {}: {}", op.address, e)))?;
            }
            for &a in &op.allocs {
                if a >= n_allocs {
                    return Err(ShiftError::Parse(format!(
                        "alloc {} of op {} is out of range", a, op.address
                    )));
                }
                g.insert_op_alloc(from, AllocAddress(a))?;
            }
        }
        for op in &self.ops {
            match op.fwd_link {
                -1                                  => {},
                l if l >= 0 && (l as usize) < n_ops => {
                    g.insert_link(OpAddress(op.address), OpAddress(l as usize))
                        .map_err(|e| ShiftError::Parse(format!("fwdLink of op {}: {}", op.address, e)))?;
                },
                l                                   => {
                    return Err(ShiftError::Parse(format!(
                        "fwdLink {} of op {} is out of range", l, op.address
                    )));
                }
            }
        }

        Ok(g)
    }
}

impl Graph {
    pub fn to_json(&self) -> ShiftResult<String> {
        Ok(serde_json::to_string(&GraphRecord::from_graph(self))?)
    }

    pub fn to_json_pretty(&self) -> ShiftResult<String> {
        Ok(serde_json::to_string_pretty(&GraphRecord::from_graph(self))?)
    }

    pub fn from_json(s: &str) -> ShiftResult<Graph> {
        let record: GraphRecord = serde_json::from_str(s)?;
        record.into_graph()
    }

    pub fn write_json(&self, path: &std::path::Path) -> ShiftResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &GraphRecord::from_graph(self))?;
        writer.flush()?;

        Ok(())
    }
}

/// Reads graphs serialized with [Graph::to_json].
pub struct JsonGraphParser {
    pub path: PathBuf,
}

impl GraphGen for JsonGraphParser {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
        }
    }

    fn read_graph(&self) -> ShiftResult<Graph> {
        let reader = BufReader::new(File::open(&self.path)?);
        let record: GraphRecord = serde_json::from_reader(reader)?;
        record.into_graph()
    }
}

/// What the command line tools print in JSON mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReport {
    pub schedule:       Vec<OpAddress>,
    pub liveness:       Vec<AllocWeight>,
    pub max_liveness:   AllocWeight,
    pub sum_liveness:   AllocWeight,
    pub rotation:       RotationOutcome,
    pub from_cache:     bool,
}

impl ScheduleReport {
    pub fn new(sg: &crate::algo::ScheduledGraph) -> ShiftResult<Self> {
        Ok(Self {
            schedule:       sg.get_schedule().to_vec(),
            liveness:       sg.get_liveness()?.to_vec(),
            max_liveness:   sg.get_max_liveness()?,
            sum_liveness:   sg.get_sum_liveness()?,
            rotation:       sg.rotation_outcome(),
            from_cache:     sg.is_from_cache(),
        })
    }

    /// Renders the report the way `kind` asks for.
    pub fn render(&self, sg: &crate::algo::ScheduledGraph, kind: OutputKind) -> ShiftResult<String> {
        Ok(match kind {
            OutputKind::Schedule    => self.schedule.iter()
                .map(|&op| format!("{}\t{}", op, sg.get_graph().get_op(op).debug_name()))
                .join("\n"),
            OutputKind::Table       => format!(
                "{}max liveness: {}\nsum liveness: {}\nrotation: {}",
                sg.get_liveness_string(), self.max_liveness, self.sum_liveness, self.rotation
            ),
            OutputKind::Json        => serde_json::to_string_pretty(self)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Graph {
        let mut g = Graph::new();
        let o = g.insert_ops(&["load", "mul", "add", "store"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[2]), (o[1], o[3]), (o[2], o[3])]).unwrap();
        g.insert_link(o[2], o[3]).unwrap();
        let a0 = g.insert_alloc(AllocWeight::new(4.5, 0) + AllocWeight::new(1.0, -2));
        let a1 = g.insert_alloc(2.0);
        g.insert_op_allocs(&[o[0], o[1]], a0).unwrap();
        g.insert_op_allocs(&[o[1], o[2], o[3]], a1).unwrap();
        g
    }

    #[test]
    fn json_preserves_the_graph() {
        let g = sample();
        let s = g.to_json().unwrap();
        assert!(s.contains("\"debugString\":\"mul\""));
        assert!(s.contains("\"fwdLink\":-1"));
        let back = Graph::from_json(&s).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn json_is_order_independent() {
        let s = r#"{"ops": [
            {"address": 1, "debugString": "b", "fwdLink": -1, "outs": [], "allocs": [0]},
            {"address": 0, "debugString": "a", "fwdLink": 1, "outs": [1], "allocs": [0]}],
            "allocs": [{"address": 0, "weight": [0, 0, 0, 3, 0, 0, 0]}]}"#;
        let g = Graph::from_json(s).unwrap();
        assert_eq!(g.get_op(OpAddress(0)).debug_name(), "a");
        assert_eq!(g.get_op(OpAddress(0)).fwd_link(), Some(OpAddress(1)));
        assert_eq!(g.get_alloc(AllocAddress(0)).weight(), AllocWeight::from(3.0));
    }

    #[test]
    fn malformed_documents() {
        let dup = r#"{"ops": [
            {"address": 0, "debugString": "a", "fwdLink": -1, "outs": [], "allocs": []},
            {"address": 0, "debugString": "b", "fwdLink": -1, "outs": [], "allocs": []}],
            "allocs": []}"#;
        assert!(matches!(Graph::from_json(dup), Err(ShiftError::Parse(m)) if m.contains("not unique")));

        let range = r#"{"ops": [{"address": 3, "debugString": "a", "fwdLink": -1, "outs": [], "allocs": []}],
            "allocs": []}"#;
        assert!(matches!(Graph::from_json(range), Err(ShiftError::Parse(m)) if m.contains("out of range")));

        let short = r#"{"ops": [], "allocs": [{"address": 0, "weight": [1, 2]}]}"#;
        assert!(matches!(Graph::from_json(short), Err(ShiftError::Parse(m)) if m.contains("expected 7")));

        let missing = r#"{"ops": [{"address": 0, "fwdLink": -1, "outs": [], "allocs": []}], "allocs": []}"#;
        assert!(matches!(Graph::from_json(missing), Err(ShiftError::Json(e)) if e.to_string().contains("debugString")));

        let bad_out = r#"{"ops": [{"address": 0, "debugString": "a", "fwdLink": -1, "outs": [5], "allocs": []}],
            "allocs": []}"#;
        assert!(Graph::from_json(bad_out).is_err());

        let bad_link = r#"{"ops": [{"address": 0, "debugString": "a", "fwdLink": 0, "outs": [], "allocs": []}],
            "allocs": []}"#;
        assert!(Graph::from_json(bad_link).is_err());
    }

    #[test]
    fn reports_carry_the_outcome() {
        use crate::algo::{RotationTermination, ScheduledGraph, Settings};
        let s = Settings {
            rotation_termination: RotationTermination::pre_start(),
            ..Settings::default()
        };
        let sg = ScheduledGraph::new(sample(), &s).unwrap();
        let report = ScheduleReport::new(&sg).unwrap();
        assert_eq!(report.rotation, RotationOutcome::NotRun);
        assert!(!report.from_cache);
        assert!(report.render(&sg, OutputKind::Json).unwrap().contains("\"rotation\": \"NotRun\""));
        assert!(report.render(&sg, OutputKind::Table).unwrap().ends_with("rotation: not run"));
    }
}
