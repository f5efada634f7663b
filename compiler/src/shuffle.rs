// shuffle.rs — Per-stage shuffle key resolution
//
// For a stage with a reduce side, resolves how each rendezvous input is
// grouped and sorted: one segment per input port. The source class is the
// producer's output type, the target class the input's declared type; key
// terms bind to properties of the target.
//
// Preconditions: `stage` belongs to `stage_graph`.
// Postconditions: term ids are 1..=n within each segment, grouping terms
//                 first; port indexes are 1..=n across the model; every
//                 segment of one element agrees with the element's first
//                 segment on grouping term count and property types.
// Failure modes: E0201 missing rendezvous processor, E0301 unknown data
//                class, E0302 unknown property, E0303 grouping mismatch,
//                E0304 input without a shuffle key. Offending segments are
//                dropped and the model is marked partial.
// Side effects: appends diagnostics to `sink`.

use std::collections::HashSet;
use std::fmt;

use crate::datamodel::{DataClass, DataClassRegistry, Property};
use crate::diag::{codes, DiagCode, DiagSink, Diagnostic};
use crate::graph::{DataType, FlowGraph, ShuffleKey, SortDirection};
use crate::id::{ElementId, PortId};
use crate::plan::{StageBlock, StageGraph};
use crate::registry::{ProcessorKind, ProcessorRegistry};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arrangement {
    Grouping,
    Ascending,
    Descending,
}

impl fmt::Display for Arrangement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arrangement::Grouping => "group",
            Arrangement::Ascending => "asc",
            Arrangement::Descending => "desc",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// 1-based within the segment.
    pub id: usize,
    pub property: Property,
    pub arrangement: Arrangement,
}

/// Shuffle of one rendezvous input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 0-based position of the element among the stage's rendezvous elements.
    pub element_index: usize,
    /// 1-based position of the segment in the model.
    pub port_index: usize,
    pub element: ElementId,
    pub port: PortId,
    pub source: DataClass,
    pub target: DataClass,
    pub terms: Vec<Term>,
}

impl Segment {
    pub fn grouping_terms(&self) -> impl Iterator<Item = &Term> {
        self.terms
            .iter()
            .filter(|t| t.arrangement == Arrangement::Grouping)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleModel {
    /// Number of the analyzed stage.
    pub stage: usize,
    pub segments: Vec<Segment>,
    /// True when some segment was dropped because of an error.
    pub partial: bool,
}

impl ShuffleModel {
    pub fn segment_for(&self, port: PortId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.port == port)
    }

    pub fn segments_of(&self, element: ElementId) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.element == element)
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

/// Resolve the shuffle of `stage`. Returns `None` iff the stage has no
/// reduce side.
pub fn analyze_shuffle(
    stage_graph: &StageGraph,
    stage: &StageBlock,
    processors: &ProcessorRegistry,
    data_classes: &DataClassRegistry,
    sink: &DiagSink,
) -> Option<ShuffleModel> {
    if !stage.has_reduce() {
        tracing::debug!(stage = stage.number, "no shuffle");
        return None;
    }
    let graph = &stage_graph.graph;
    let mut cx = Analyzer {
        graph,
        data_classes,
        sink,
        partial: false,
    };

    let mut segments: Vec<Segment> = Vec::new();
    for (element_index, element) in rendezvous_elements(stage_graph, stage).into_iter().enumerate() {
        let elem = graph.element(element);
        let kind = processors.resolve(elem).map(|p| p.kind);
        if kind != Some(ProcessorKind::Rendezvous) {
            let kind_name = elem.operator().map(|d| d.kind.as_str()).unwrap_or("");
            sink.emit(
                Diagnostic::error(
                    codes::E0201,
                    format!("no rendezvous processor for `{}` (kind `{kind_name}`)", elem.name),
                )
                .with_element(element, elem.name.clone())
                .with_hint("register a processor of kind `rendezvous` for this operator kind"),
            );
            cx.partial = true;
            continue;
        }

        let resolved: Vec<Segment> = elem
            .inputs
            .iter()
            .filter_map(|&port| cx.resolve_segment(element_index, element, port))
            .collect();
        for seg in cx.check_consistent(element, resolved) {
            segments.push(Segment {
                port_index: segments.len() + 1,
                ..seg
            });
        }
    }

    tracing::debug!(
        stage = stage.number,
        segments = segments.len(),
        partial = cx.partial,
        "analyzed shuffle"
    );
    Some(ShuffleModel {
        stage: stage.number,
        segments,
        partial: cx.partial,
    })
}

/// Owners of the reduce blocks' inputs, first occurrence order.
fn rendezvous_elements(stage_graph: &StageGraph, stage: &StageBlock) -> Vec<ElementId> {
    let mut seen = HashSet::new();
    stage
        .reduce_blocks
        .iter()
        .flat_map(|b| stage_graph.block(*b).inputs.iter())
        .map(|p| stage_graph.graph.owner(*p))
        .filter(|e| seen.insert(*e))
        .collect()
}

struct Analyzer<'a> {
    graph: &'a FlowGraph,
    data_classes: &'a DataClassRegistry,
    sink: &'a DiagSink,
    partial: bool,
}

impl Analyzer<'_> {
    fn error(&mut self, code: DiagCode, element: ElementId, message: String) {
        self.sink.emit(
            Diagnostic::error(code, message)
                .with_element(element, self.graph.element(element).name.clone()),
        );
        self.partial = true;
    }

    fn resolve_segment(&mut self, element_index: usize, element: ElementId, port: PortId) -> Option<Segment> {
        let graph = self.graph;
        let p = graph.port(port);
        let label = graph.port_label(port);
        let Some(key) = p.key.clone() else {
            self.error(
                codes::E0304,
                element,
                format!("rendezvous input `{label}` declares no shuffle key"),
            );
            return None;
        };

        // Records enter in the type of their producer and are regrouped as
        // the input's declared type; key terms bind to the latter.
        let source_type = graph
            .opposites(port)
            .first()
            .map(|u| graph.port(*u).data_type.clone())
            .unwrap_or_else(|| p.data_type.clone());
        let source = self.load_class(element, &source_type, &format!("data class `{source_type}` feeding `{label}`"));
        let target = self.load_class(element, &p.data_type, &format!("data class `{}` of `{label}`", p.data_type));
        let (Some(source), Some(target)) = (source, target) else {
            return None;
        };

        let terms = self.resolve_terms(element, &label, &key, &target)?;
        Some(Segment {
            element_index,
            port_index: 0,
            element,
            port,
            source,
            target,
            terms,
        })
    }

    fn load_class(&mut self, element: ElementId, data_type: &DataType, what: &str) -> Option<DataClass> {
        let class = self.data_classes.load(data_type).cloned();
        if class.is_none() {
            self.error(codes::E0301, element, format!("{what} is not defined"));
        }
        class
    }

    fn resolve_terms(
        &mut self,
        element: ElementId,
        label: &str,
        key: &ShuffleKey,
        target: &DataClass,
    ) -> Option<Vec<Term>> {
        let wanted = key
            .group
            .iter()
            .map(|name| (name, Arrangement::Grouping))
            .chain(key.order.iter().map(|o| {
                let arrangement = match o.direction {
                    SortDirection::Ascending => Arrangement::Ascending,
                    SortDirection::Descending => Arrangement::Descending,
                };
                (&o.property, arrangement)
            }));

        let mut terms = Vec::new();
        let mut complete = true;
        for (name, arrangement) in wanted {
            match target.find_property(name) {
                Some(property) => terms.push(Term {
                    id: terms.len() + 1,
                    property: property.clone(),
                    arrangement,
                }),
                None => {
                    self.error(
                        codes::E0302,
                        element,
                        format!(
                            "data class `{}` has no property `{name}` (key of `{label}`)",
                            target.name
                        ),
                    );
                    complete = false;
                }
            }
        }
        complete.then_some(terms)
    }

    /// Keep the segments whose grouping terms match the first segment's in
    /// count and property types.
    fn check_consistent(&mut self, element: ElementId, segments: Vec<Segment>) -> Vec<Segment> {
        let Some(first) = segments.first() else {
            return segments;
        };
        let expected: Vec<_> = first.grouping_terms().map(|t| t.property.ty).collect();
        let mut kept = Vec::with_capacity(segments.len());
        for (i, seg) in segments.iter().enumerate() {
            let actual: Vec<_> = seg.grouping_terms().map(|t| t.property.ty).collect();
            if i > 0 && actual != expected {
                let label = self.graph.port_label(seg.port);
                let message = if actual.len() != expected.len() {
                    format!(
                        "`{label}` groups by {} properties but the first input groups by {}",
                        actual.len(),
                        expected.len()
                    )
                } else {
                    format!("grouping property types of `{label}` differ from the first input")
                };
                self.error(codes::E0303, element, message);
                continue;
            }
            kept.push(seg.clone());
        }
        kept
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowGraphBuilder;
    use crate::datamodel::PropertyType;
    use crate::graph::{Boundary, DataType, OperatorDesc, PortDecl};
    use crate::normalize::normalize;
    use crate::plan::build_stage_graph;

    fn classes() -> DataClassRegistry {
        DataClassRegistry::from_classes(vec![
            DataClass::new("Sales")
                .with("store", PropertyType::Text)
                .with("amount", PropertyType::Long),
            DataClass::new("Store")
                .with("code", PropertyType::Text)
                .with("opened", PropertyType::Date),
        ])
        .unwrap()
    }

    fn port(name: &str, ty: &str, key: Option<ShuffleKey>) -> PortDecl {
        let decl = PortDecl::new(name, DataType::new(ty));
        match key {
            Some(k) => decl.with_key(k),
            None => decl,
        }
    }

    fn join_stage(left: Option<ShuffleKey>, right: Option<ShuffleKey>, kind: &str) -> StageGraph {
        let mut b = FlowGraphBuilder::new();
        b.input_typed("sales", DataType::new("Sales"))
            .input_typed("stores", DataType::new("Store"))
            .operator_with(
                "join",
                OperatorDesc::new("join", kind),
                vec![port("sales", "Sales", left), port("stores", "Store", right)],
                vec![PortDecl::new("out", DataType::new("Sales"))],
                Boundary::Shuffle,
            )
            .output_typed("out", DataType::new("Sales"))
            .connect("sales", "join.sales")
            .connect("stores", "join.stores")
            .connect("join", "out");
        let mut g = b.build().unwrap();
        normalize(&mut g);
        let sink = DiagSink::new();
        let sg = build_stage_graph(g, &sink);
        assert!(sink.is_empty());
        sg
    }

    fn run(sg: &StageGraph) -> (Option<ShuffleModel>, Vec<Diagnostic>) {
        let sink = DiagSink::new();
        let model = analyze_shuffle(
            sg,
            &sg.stages[0],
            &ProcessorRegistry::with_builtins(),
            &classes(),
            &sink,
        );
        (model, sink.take())
    }

    #[test]
    fn terms_grouping_first_then_orderings() {
        let sg = join_stage(
            Some(ShuffleKey::group(["store"]).then("amount", SortDirection::Descending)),
            Some(ShuffleKey::group(["code"]).then("opened", SortDirection::Ascending)),
            "master_join",
        );
        let (model, diags) = run(&sg);
        assert!(diags.is_empty(), "{diags:?}");
        let model = model.unwrap();
        assert!(!model.partial);
        assert_eq!(model.segments.len(), 2);
        let s = &model.segments[0];
        assert_eq!((s.element_index, s.port_index), (0, 1));
        let terms: Vec<_> = s
            .terms
            .iter()
            .map(|t| (t.id, t.property.name.as_str(), t.arrangement))
            .collect();
        assert_eq!(
            terms,
            vec![
                (1, "store", Arrangement::Grouping),
                (2, "amount", Arrangement::Descending)
            ]
        );
        assert_eq!(model.segments[1].port_index, 2);
        assert_eq!(model.segments[1].target.name, "Store");
    }

    #[test]
    fn grouping_type_mismatch_drops_segment() {
        let sg = join_stage(
            Some(ShuffleKey::group(["store"])),
            Some(ShuffleKey::group(["opened"])),
            "cogroup",
        );
        let (model, diags) = run(&sg);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0303));
        assert_eq!(diags[0].element.as_ref().unwrap().name, "join");
        let model = model.unwrap();
        assert!(model.partial);
        assert_eq!(model.segments.len(), 1);
    }

    #[test]
    fn grouping_count_mismatch_is_reported() {
        let sg = join_stage(
            Some(ShuffleKey::group(["store", "amount"])),
            Some(ShuffleKey::group(["code"])),
            "cogroup",
        );
        let (_, diags) = run(&sg);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("groups by 1 properties"));
    }

    #[test]
    fn unknown_property_and_missing_key() {
        let sg = join_stage(Some(ShuffleKey::group(["nope"])), None, "cogroup");
        let (model, diags) = run(&sg);
        let codes_seen: Vec<_> = diags.iter().map(|d| d.code.unwrap()).collect();
        assert_eq!(codes_seen, vec![codes::E0302, codes::E0304]);
        let model = model.unwrap();
        assert!(model.segments.is_empty());
        assert!(model.partial);
    }

    #[test]
    fn non_rendezvous_processor_is_skipped() {
        let sg = join_stage(
            Some(ShuffleKey::group(["store"])),
            Some(ShuffleKey::group(["code"])),
            "update",
        );
        let (model, diags) = run(&sg);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0201));
        assert!(model.unwrap().segments.is_empty());
    }

    #[test]
    fn unknown_data_class() {
        let mut b = FlowGraphBuilder::with_data_type(DataType::new("Ghost"));
        b.input("in")
            .operator_with(
                "fold",
                OperatorDesc::new("fold", "fold"),
                vec![port("in", "Ghost", Some(ShuffleKey::group(["id"])))],
                vec![PortDecl::new("out", DataType::new("Ghost"))],
                Boundary::Shuffle,
            )
            .output("out")
            .connect("in", "fold")
            .connect("fold", "out");
        let mut g = b.build().unwrap();
        normalize(&mut g);
        let sg = build_stage_graph(g, &DiagSink::new());
        let (model, diags) = run(&sg);
        assert_eq!(diags[0].code, Some(codes::E0301));
        assert!(model.unwrap().partial);
    }

    fn retyped_stage(producer: &str) -> StageGraph {
        let mut b = FlowGraphBuilder::new();
        b.input_typed("in", DataType::new(producer))
            .operator_with(
                "fold",
                OperatorDesc::new("fold", "fold"),
                vec![port("in", "Sales", Some(ShuffleKey::group(["store"])))],
                vec![PortDecl::new("out", DataType::new("Sales"))],
                Boundary::Shuffle,
            )
            .output_typed("out", DataType::new("Sales"))
            .connect("in", "fold")
            .connect("fold", "out");
        let mut g = b.build().unwrap();
        normalize(&mut g);
        let sink = DiagSink::new();
        let sg = build_stage_graph(g, &sink);
        assert!(sink.is_empty());
        sg
    }

    #[test]
    fn source_class_comes_from_the_producer() {
        let (model, diags) = run(&retyped_stage("Store"));
        assert!(diags.is_empty(), "{diags:?}");
        let seg = &model.unwrap().segments[0];
        assert_eq!(seg.source.name, "Store");
        assert_eq!(seg.target.name, "Sales");
        assert_eq!(seg.terms[0].property.name, "store");
    }

    #[test]
    fn unknown_source_class_drops_segment() {
        let (model, diags) = run(&retyped_stage("Ghost"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0301));
        assert!(diags[0].message.contains("`Ghost` feeding `fold.in`"), "{}", diags[0].message);
        let model = model.unwrap();
        assert!(model.partial);
        assert!(model.segments.is_empty());
    }

    #[test]
    fn map_only_stage_has_no_shuffle() {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op", "update", "in", "out", Boundary::None)
            .output("out")
            .connect("in", "op")
            .connect("op", "out");
        let g = b.build().unwrap();
        let sg = build_stage_graph(g, &DiagSink::new());
        assert!(run(&sg).0.is_none());
    }
}
