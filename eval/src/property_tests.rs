/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use proptest::prelude::*;

use std::collections::HashMap;
use std::path::PathBuf;

use quern_tasks::{TaskId, TaskResult, TaskSpec, Tasks, Val};

use super::Evaluator;

fn chain(side_a: i32, side_b: i32) -> (Tasks, TaskId, TaskId) {
    let mut tasks = Tasks::new();
    let a = tasks.add(TaskSpec::task(vec![], |_ctx| Ok(Val::new(0i64))).side_hash(side_a));
    let b = tasks.add(TaskSpec::task(vec![a], |_ctx| Ok(Val::new(0i64))).side_hash(side_b));
    (tasks, a, b)
}

fn evaluator(logic_hash: i32) -> Evaluator {
    Evaluator::new(PathBuf::from("home"), PathBuf::from("out")).with_logic_hash(logic_hash)
}

proptest! {
    #[test]
    fn fingerprint_is_a_pure_function_of_its_inputs(
        side_a in any::<i32>(),
        side_b in any::<i32>(),
        upstream_hash in any::<i32>(),
        logic_hash in any::<i32>(),
    ) {
        let (tasks, a, b) = chain(side_a, side_b);
        let ev = evaluator(logic_hash);
        let mut upstream = HashMap::new();
        upstream.insert(a, TaskResult::Success { value: Val::new(0i64), value_hash: upstream_hash });

        let first = ev.group_inputs_hash(&tasks, &[b], &upstream);
        let second = ev.group_inputs_hash(&tasks, &[b], &upstream);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn fingerprint_depends_on_the_set_of_externals_not_their_wiring(
        upstream_hash in any::<i32>(),
        s1 in any::<i32>(),
        s2 in any::<i32>(),
        s3 in any::<i32>(),
    ) {
        // A three-member group whose members name the same external
        // dependency `copies`-many times each. However the reference is
        // wired internally, the upstream value set is {dep}, so the
        // fingerprint must not move.
        let build = |m1_copies: usize, m2_copies: usize| {
            let mut tasks = Tasks::new();
            let dep = tasks.add(TaskSpec::task(vec![], |_ctx| Ok(Val::new(0i64))));
            let m1 = tasks.add(
                TaskSpec::task(vec![dep; m1_copies], |_ctx| Ok(Val::new(0i64))).side_hash(s1),
            );
            let m2 = tasks.add(
                TaskSpec::task(vec![dep; m2_copies], |_ctx| Ok(Val::new(0i64))).side_hash(s2),
            );
            let terminal = tasks.add(
                TaskSpec::task(vec![m1, m2], |_ctx| Ok(Val::new(0i64))).side_hash(s3),
            );
            (tasks, dep, vec![m1, m2, terminal])
        };
        let ev = evaluator(0);
        let fingerprint = |shape: (Tasks, TaskId, Vec<TaskId>)| {
            let (tasks, dep, group) = shape;
            let mut upstream = HashMap::new();
            upstream.insert(dep, TaskResult::Success {
                value: Val::new(0i64),
                value_hash: upstream_hash,
            });
            ev.group_inputs_hash(&tasks, &group, &upstream)
        };

        let once = fingerprint(build(1, 0));
        // The same dependency declared by both members.
        prop_assert_eq!(fingerprint(build(1, 1)), once);
        // The same dependency declared twice by one member.
        prop_assert_eq!(fingerprint(build(2, 0)), once);
    }

    #[test]
    fn fingerprint_tracks_side_hash_and_upstream_changes(
        side_a in any::<i32>(),
        side_b in any::<i32>(),
        upstream_hash in any::<i32>(),
    ) {
        let (tasks, a, b) = chain(side_a, side_b);
        let ev = evaluator(0);
        let mut upstream = HashMap::new();
        upstream.insert(a, TaskResult::Success { value: Val::new(0i64), value_hash: upstream_hash });
        let base = ev.group_inputs_hash(&tasks, &[b], &upstream);

        // A changed side hash misses.
        let (bumped_tasks, bumped_a, bumped_b) = chain(side_a, side_b.wrapping_add(1));
        let mut bumped_upstream = HashMap::new();
        bumped_upstream.insert(bumped_a, TaskResult::Success { value: Val::new(0i64), value_hash: upstream_hash });
        prop_assert_ne!(ev.group_inputs_hash(&bumped_tasks, &[bumped_b], &bumped_upstream), base);

        // A changed upstream value-hash misses.
        upstream.insert(a, TaskResult::Success { value: Val::new(0i64), value_hash: upstream_hash.wrapping_add(1) });
        prop_assert_ne!(ev.group_inputs_hash(&tasks, &[b], &upstream), base);
    }

    #[test]
    fn failing_upstream_contributes_nothing(
        side_b in any::<i32>(),
        upstream_hash in any::<i32>(),
    ) {
        let (tasks, a, b) = chain(0, side_b);
        let ev = evaluator(0);

        let mut skipped = HashMap::new();
        skipped.insert(a, TaskResult::Skipped);
        let mut failed = HashMap::new();
        failed.insert(a, TaskResult::Failure {
            msg: "broken".to_owned(),
            partial: Some((Val::new(0i64), upstream_hash)),
        });

        // Non-success results never feed the fingerprint, whatever partial
        // value they carry.
        prop_assert_eq!(
            ev.group_inputs_hash(&tasks, &[b], &skipped),
            ev.group_inputs_hash(&tasks, &[b], &failed)
        );
    }
}
