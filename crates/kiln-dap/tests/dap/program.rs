//! Program builder tests: chain structure, sub-branches, return points,
//! direct-parent selection, and chain termination.

use std::path::Path;

use pretty_assertions::assert_eq;

use kiln_dap::program::{self, parent_input, Program, Step, StepId};
use kiln_llb::{FileAction, FileOp};

use super::*;

fn lower(def: &Definition) -> Program {
    let graph = def.load().expect("definition loads");
    program::build(
        &graph,
        &def.source,
        &def.metadata,
        Path::new(ROOT),
        &IdPool::new(),
    )
    .expect("program builds")
}

fn terminates(program: &Program, start: StepId, edge: fn(&Step) -> Option<StepId>) -> bool {
    let mut cursor = Some(start);
    let mut hops = 0;
    while let Some(id) = cursor {
        hops += 1;
        if hops > program.len() + 1 {
            return false;
        }
        cursor = edge(program.step(id));
    }
    true
}

#[test]
fn test_linear_chain() {
    let (def, a, b) = linear_build();
    let program = lower(&def);

    let entry = program.entry().expect("entry step");
    let head = program.step(entry);
    assert_eq!(head.digest.as_ref(), Some(&b));
    assert_eq!(head.parent, Some(0));
    assert_eq!(head.out, None);
    // With no side inputs, Step-In behaves as Step-Over.
    assert_eq!(head.into, head.next);

    let base_id = head.next.expect("base step");
    let base = program.step(base_id);
    assert_eq!(base.digest.as_ref(), Some(&a));
    assert_eq!(base.next, None);
    assert_eq!(base.parent, None);

    assert_eq!(program.len(), 2);
}

#[test]
fn test_frames_are_unique_and_located() {
    let (def, _a, b) = linear_build();
    let program = lower(&def);

    let entry = program.entry().unwrap();
    let head = program.step(entry);
    let frame = program.frame(head.frame).expect("head frame");
    assert_eq!(frame.name, "RUN make");
    assert_eq!(frame.path.as_deref(), Some(BUILDFILE));
    assert_eq!(frame.range.unwrap().start.line, 2);
    assert_eq!(frame.digest.as_ref(), Some(&b));

    let base = program.step(head.next.unwrap());
    assert_ne!(head.frame, base.frame);
}

#[test]
fn test_sub_branch_structure() {
    let (def, a, s, c) = staged_build();
    let program = lower(&def);

    // C, S, S's return point, A.
    assert_eq!(program.len(), 4);

    let c_id = program.entry().unwrap();
    let c_step = program.step(c_id);
    assert_eq!(c_step.digest.as_ref(), Some(&c));
    assert_eq!(c_step.parent, Some(0));

    let a_id = c_step.next.expect("parent chain continues at A");
    assert_eq!(program.step(a_id).digest.as_ref(), Some(&a));

    // Step-In enters the stage branch.
    let s_id = c_step.into.expect("side input branch");
    let s_step = program.step(s_id);
    assert_eq!(s_step.digest.as_ref(), Some(&s));
    assert_eq!(s_step.out, Some(c_id));

    // The stage's return point pauses once more, then rejoins the parent
    // chain after C.
    let rp_id = s_step.next.expect("return point");
    let rp = program.step(rp_id);
    assert_eq!(rp.digest, None);
    assert_eq!(rp.next, Some(a_id));
    assert_eq!(rp.into, Some(a_id));
}

#[test]
fn test_scan_into_walks_depth_first() {
    let (def, a, s, _c) = staged_build();
    let program = lower(&def);
    let entry = program.entry().unwrap();

    let digests: Vec<Option<Digest>> = program
        .scan_into(entry)
        .map(|id| program.step(id).digest.clone())
        .collect();
    assert_eq!(digests, vec![Some(s), None, Some(a)]);
}

#[test]
fn test_stack_nests_by_branch() {
    let (def, _a, _s, _c) = staged_build();
    let program = lower(&def);
    let entry = program.entry().unwrap();

    let c_stack = program.stack(entry);
    assert_eq!(c_stack.len(), 1);
    assert_eq!(c_stack[0].range.unwrap().start.line, 4);

    let s_id = program.step(entry).into.unwrap();
    let s_stack = program.stack(s_id);
    assert_eq!(s_stack.len(), 2);
    assert_eq!(s_stack[0].range.unwrap().start.line, 3);
    assert_eq!(s_stack[1].range.unwrap().start.line, 4);
}

#[test]
fn test_all_chains_terminate() {
    let (def, _a, _s, _c) = staged_build();
    let program = lower(&def);
    for id in 0..program.len() {
        assert!(terminates(&program, id, |s| s.next), "next* from {id}");
        assert!(terminates(&program, id, |s| s.into), "into* from {id}");
        assert!(terminates(&program, id, |s| s.out), "out* from {id}");
    }
}

#[test]
fn test_parent_input_rules() {
    let base = Op::generic(vec![]);
    let dgst = base.digest();

    assert_eq!(parent_input(&base), None);
    assert_eq!(
        parent_input(&Op::generic(vec![Input::new(dgst.clone(), 0)])),
        Some(0)
    );

    // Exec without a root mount has no direct parent.
    let exec = Op::exec(
        vec![Input::new(dgst.clone(), 0)],
        ExecOp {
            mounts: vec![Mount {
                input: 0,
                dest: "/cache".into(),
                readonly: false,
            }],
            meta: ExecMeta::default(),
        },
    );
    assert_eq!(parent_input(&exec), None);

    // File ops follow the first action with an in-range input.
    let file = Op::file(
        vec![Input::new(dgst.clone(), 0)],
        FileOp {
            actions: vec![
                FileAction {
                    input: -1,
                    kind: "mkdir".into(),
                    path: "/out".into(),
                },
                FileAction {
                    input: 0,
                    kind: "copy".into(),
                    path: "/out/bin".into(),
                },
            ],
        },
    );
    assert_eq!(parent_input(&file), Some(0));

    let scratch_file = Op::file(
        vec![],
        FileOp {
            actions: vec![FileAction {
                input: -1,
                kind: "mkfile".into(),
                path: "/etc/cfg".into(),
            }],
        },
    );
    assert_eq!(parent_input(&scratch_file), None);
}
