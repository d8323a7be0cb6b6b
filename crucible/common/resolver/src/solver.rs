// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
    time::{Duration, Instant},
};

use anyhow::Result;
use recipe::Requirement;
use serde::Serialize;
use tracing::debug;

use crate::{Candidate, Lockfile, RepoIndex, ResolveError};

#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// Follow optional dependency edges (they stay skippable).
    pub allow_optional: bool,
    /// Accept a still-consistent lockfile entry without searching.
    pub prefer_locked: bool,
    pub timeout: Option<Duration>,
    pub max_steps: u64,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            allow_optional: false,
            prefer_locked: true,
            timeout: None,
            max_steps: 20000,
        }
    }
}

#[derive(Debug)]
pub struct ResolveResult {
    pub ok: bool,
    /// Chosen candidate per package name.
    pub chosen: BTreeMap<String, Candidate>,
    /// Topological install order of candidate ids, dependencies first.
    pub order: Vec<String>,
    pub issues: Vec<String>,
}

impl ResolveResult {
    fn failure(issues: Vec<String>) -> Self {
        Self {
            ok: false,
            chosen: BTreeMap::new(),
            order: Vec::new(),
            issues,
        }
    }

    /// Converts a failed result into a typed error.
    pub fn into_result(self) -> Result<Self, ResolveError> {
        if self.ok {
            Ok(self)
        } else {
            Err(ResolveError::Failed {
                issues: self.issues,
            })
        }
    }

    /// Package names in install order (ids reduced to names).
    pub fn names_in_order(&self) -> Vec<String> {
        let mut by_id: BTreeMap<String, &str> = BTreeMap::new();
        for candidate in self.chosen.values() {
            by_id.insert(candidate.id(), candidate.name.as_str());
        }
        self.order
            .iter()
            .filter_map(|id| by_id.get(id).map(|name| name.to_string()))
            .collect()
    }
}

/// Diagnostics for failed or puzzling resolutions.
#[derive(Debug, Serialize)]
pub struct Explanation {
    pub requests: Vec<String>,
    pub candidates: BTreeMap<String, Vec<String>>,
    pub providers: BTreeMap<String, Vec<String>>,
    pub tips: Vec<String>,
}

/// An active requirement plus the candidate that introduced it, for
/// diagnostics.
#[derive(Clone, Debug)]
struct ActiveReq {
    req: Requirement,
    origin: Option<String>,
}

impl ActiveReq {
    fn describe(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{}->{}", origin, self.req.raw()),
            None => self.req.raw().to_string(),
        }
    }
}

struct SearchCtx<'a> {
    index: &'a RepoIndex,
    allow_optional: bool,
    deadline: Option<Instant>,
    max_steps: u64,
    steps: u64,
    failures: Vec<String>,
    memo: HashSet<String>,
}

/// The backtracking solver. Holds the repository index and the lockfile.
pub struct DependencyResolver<'a> {
    index: &'a RepoIndex,
    lockfile: Lockfile,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(index: &'a RepoIndex, lockfile_path: &Path) -> Self {
        Self {
            index,
            lockfile: Lockfile::load(lockfile_path),
        }
    }

    pub fn index(&self) -> &RepoIndex {
        self.index
    }

    /// Resolves an ordered list of root requirements into a dependency-closed,
    /// conflict-free candidate set plus a topological install order.
    pub fn resolve(
        &mut self,
        roots: &[Requirement],
        options: &ResolveOptions,
    ) -> Result<ResolveResult> {
        if options.prefer_locked {
            if let Some(result) = self.try_locked(roots) {
                return Ok(result);
            }
        }

        let mut ctx = SearchCtx {
            index: self.index,
            allow_optional: options.allow_optional,
            deadline: options.timeout.map(|t| Instant::now() + t),
            max_steps: options.max_steps,
            steps: 0,
            failures: Vec::new(),
            memo: HashSet::new(),
        };
        let mut chosen = BTreeMap::new();
        let mut active: Vec<ActiveReq> = roots
            .iter()
            .map(|req| ActiveReq {
                req: req.clone(),
                origin: None,
            })
            .collect();

        match backtrack(&mut ctx, &mut chosen, &mut active) {
            Err(reason) => return Ok(ResolveResult::failure(vec![reason.to_string()])),
            Ok(false) => {
                let mut issues = ctx.failures;
                issues.dedup();
                if issues.is_empty() {
                    issues.push("unsatisfied".to_string());
                }
                return Ok(ResolveResult::failure(issues));
            }
            Ok(true) => {}
        }
        debug!("solved in {} steps", ctx.steps);

        let issues = verify_selection(&chosen, roots);
        if !issues.is_empty() {
            return Ok(ResolveResult::failure(issues));
        }

        let (order, issues) = topological_order(&chosen);
        self.lockfile.store(roots, &chosen)?;
        Ok(ResolveResult {
            ok: true,
            chosen,
            order,
            issues,
        })
    }

    /// Convenience wrapper lowering plain requirement strings.
    pub fn resolve_names(
        &mut self,
        names: &[String],
        options: &ResolveOptions,
    ) -> Result<ResolveResult> {
        let roots = names
            .iter()
            .map(|name| Requirement::parse(name))
            .collect::<Result<Vec<_>>>()?;
        self.resolve(&roots, options)
    }

    /// Replays the lockfile entry for this root set if it still verifies
    /// consistent against the current repository.
    fn try_locked(&self, roots: &[Requirement]) -> Option<ResolveResult> {
        let locked = self.lockfile.lookup(roots)?;
        let mut chosen = BTreeMap::new();
        for (name, pinned) in locked {
            let candidate = self.index.find_exact(&pinned.name, &pinned.version)?;
            chosen.insert(name.clone(), candidate.clone());
        }
        if !verify_selection(&chosen, roots).is_empty() {
            debug!("lockfile entry is stale, re-resolving");
            return None;
        }
        let (order, issues) = topological_order(&chosen);
        if !issues.is_empty() {
            return None;
        }
        Some(ResolveResult {
            ok: true,
            chosen,
            order,
            issues: Vec::new(),
        })
    }

    /// Explains, per requirement, which candidates and providers exist and
    /// why a resolution may have failed.
    pub fn explain(&self, roots: &[Requirement]) -> Explanation {
        let mut explanation = Explanation {
            requests: roots.iter().map(|r| r.raw().to_string()).collect(),
            candidates: BTreeMap::new(),
            providers: BTreeMap::new(),
            tips: Vec::new(),
        };
        for root in roots {
            let candidates = self.index.find_candidates(root);
            explanation.candidates.insert(
                root.name().to_string(),
                candidates.iter().map(|c| c.id()).collect(),
            );
            let providers: Vec<String> = self.index.providers(root.name()).into_iter().collect();
            if candidates.is_empty() {
                if providers.is_empty() {
                    explanation.tips.push(format!(
                        "No package provides {}; add it to a recipe's provides or rebuild the index.",
                        root.name()
                    ));
                } else {
                    explanation.tips.push(format!(
                        "Providers of {} exist ({}) but none matches {}; relax the version pins.",
                        root.name(),
                        providers.join(", "),
                        root.raw()
                    ));
                }
            }
            explanation.providers.insert(root.name().to_string(), providers);
        }
        if explanation.tips.is_empty() {
            explanation.tips.push(
                "If resolution fails, check for mutually conflicting packages or stale lockfile pins."
                    .to_string(),
            );
        }
        explanation
    }
}

fn is_satisfied(chosen: &BTreeMap<String, Candidate>, req: &Requirement) -> bool {
    chosen.values().any(|candidate| candidate.satisfies(req))
}

fn fingerprint(
    chosen: &BTreeMap<String, Candidate>,
    active: &[ActiveReq],
    unsatisfied: &[usize],
) -> String {
    let ids: Vec<String> = chosen.values().map(|c| c.id()).collect();
    let mut raws: Vec<&str> = unsatisfied
        .iter()
        .map(|&i| active[i].req.raw())
        .collect();
    raws.sort_unstable();
    format!("{}|{}", ids.join(","), raws.join(","))
}

fn backtrack(
    ctx: &mut SearchCtx,
    chosen: &mut BTreeMap<String, Candidate>,
    active: &mut Vec<ActiveReq>,
) -> Result<bool, ResolveError> {
    ctx.steps += 1;
    if ctx.steps > ctx.max_steps {
        return Err(ResolveError::StepLimit);
    }
    if let Some(deadline) = ctx.deadline {
        if Instant::now() > deadline {
            return Err(ResolveError::Timeout);
        }
    }

    let unsatisfied: Vec<usize> = (0..active.len())
        .filter(|&i| !is_satisfied(chosen, &active[i].req))
        .collect();
    if unsatisfied.is_empty() {
        return Ok(true);
    }

    let key = fingerprint(chosen, active, &unsatisfied);
    if ctx.memo.contains(&key) {
        return Ok(false);
    }

    // Most-constrained-variable: expand the requirement with the fewest
    // candidates first.
    let index = ctx.index;
    let mut pick = unsatisfied[0];
    let mut candidates = index.find_candidates(&active[pick].req);
    for &i in &unsatisfied[1..] {
        let other = index.find_candidates(&active[i].req);
        if other.len() < candidates.len() {
            pick = i;
            candidates = other;
        }
    }
    let current = active[pick].clone();

    if candidates.is_empty() && !current.req.optional() {
        ctx.failures
            .push(format!("unsatisfied:{}", current.describe()));
    }

    let mut all_conflicted = !candidates.is_empty();
    for candidate in candidates {
        if let Some(existing) = chosen.get(&candidate.name) {
            // A different version of the same package is already part of the
            // solution.
            if existing.version != candidate.version {
                continue;
            }
        }
        if chosen.values().any(|c| c.conflicts_with(candidate)) {
            continue;
        }
        all_conflicted = false;

        chosen.insert(candidate.name.clone(), candidate.clone());
        let base_len = active.len();
        let mut expanded = true;
        match candidate.requirements(ctx.allow_optional) {
            Ok(reqs) => {
                let origin = candidate.id();
                for req in reqs {
                    if !is_satisfied(chosen, &req) {
                        active.push(ActiveReq {
                            req,
                            origin: Some(origin.clone()),
                        });
                    }
                }
            }
            Err(e) => {
                ctx.failures
                    .push(format!("bad_dependency:{}:{e}", candidate.id()));
                expanded = false;
            }
        }
        if expanded && backtrack(ctx, chosen, active)? {
            return Ok(true);
        }
        active.truncate(base_len);
        chosen.remove(&candidate.name);
    }

    if all_conflicted && !current.req.optional() {
        ctx.failures
            .push(format!("conflict:{}", current.describe()));
    }

    // An optional edge whose every candidate failed is skipped rather than
    // failing the branch.
    if current.req.optional() {
        let removed = active.swap_remove(pick);
        if backtrack(ctx, chosen, active)? {
            return Ok(true);
        }
        active.push(removed);
    }

    ctx.memo.insert(key);
    Ok(false)
}

/// Post-search verification: every non-optional depend of every chosen
/// candidate must be satisfied within the set, the roots included, and no
/// chosen pair may conflict.
fn verify_selection(chosen: &BTreeMap<String, Candidate>, roots: &[Requirement]) -> Vec<String> {
    let mut issues = Vec::new();

    for root in roots {
        if !root.optional() && !is_satisfied(chosen, root) {
            issues.push(format!("unsatisfied:{}", root.raw()));
        }
    }

    for candidate in chosen.values() {
        match candidate.requirements(false) {
            Ok(reqs) => {
                for req in reqs {
                    if !is_satisfied(chosen, &req) {
                        issues.push(format!("unsatisfied:{}->{}", candidate.id(), req.raw()));
                    }
                }
            }
            Err(e) => issues.push(format!("bad_dependency:{}:{e}", candidate.id())),
        }
    }

    let all: Vec<&Candidate> = chosen.values().collect();
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            if a.conflicts_with(b) {
                issues.push(format!("conflict:{}~{}", a.name, b.name));
            }
        }
    }
    issues
}

/// Kahn's algorithm over the chosen set, dependencies first.
///
/// Cycles are broken by (a) dropping optional edges, then (b) re-pointing
/// edges at providers outside the cycle; only if both fail are the remaining
/// nodes appended in deterministic order with a `cycle` issue.
fn topological_order(chosen: &BTreeMap<String, Candidate>) -> (Vec<String>, Vec<String>) {
    let (order, remaining) = kahn(chosen, true, None);
    if remaining.is_empty() {
        return (order, Vec::new());
    }
    let (order, remaining) = kahn(chosen, false, None);
    if remaining.is_empty() {
        return (order, Vec::new());
    }
    let avoid = remaining;
    let (mut order, remaining) = kahn(chosen, false, Some(&avoid));
    if remaining.is_empty() {
        return (order, Vec::new());
    }
    order.extend(remaining);
    (order, vec!["cycle".to_string()])
}

fn kahn(
    chosen: &BTreeMap<String, Candidate>,
    include_optional: bool,
    avoid: Option<&BTreeSet<String>>,
) -> (Vec<String>, BTreeSet<String>) {
    let nodes: BTreeMap<String, &Candidate> =
        chosen.values().map(|c| (c.id(), c)).collect();

    // node -> set of node ids it depends on
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (id, candidate) in &nodes {
        let mut edges = BTreeSet::new();
        let reqs = candidate.requirements(include_optional).unwrap_or_default();
        for req in reqs {
            let providers: Vec<String> = chosen
                .values()
                .filter(|p| p.satisfies(&req))
                .map(|p| p.id())
                .collect();
            let picked = providers
                .iter()
                .find(|p| avoid.map_or(true, |a| !a.contains(*p)))
                .or_else(|| providers.first());
            if let Some(provider) = picked {
                if provider != id {
                    edges.insert(provider.clone());
                }
            }
        }
        deps.insert(id.clone(), edges);
    }

    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    for (id, edges) in &deps {
        indegree.entry(id.clone()).or_insert(0);
        for dep in edges {
            *indegree.entry(id.clone()).or_insert(0) += 1;
            dependents
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::new();
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        for dependent in dependents.get(&next).cloned().unwrap_or_default() {
            let degree = indegree.get_mut(&dependent).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.insert(dependent);
            }
        }
    }

    let remaining: BTreeSet<String> = nodes
        .keys()
        .filter(|id| !order.contains(*id))
        .cloned()
        .collect();
    (order, remaining)
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;
    use recipe::DependencyExpr;
    use version::Version;

    use super::*;

    fn candidate(name: &str, version: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            version: Version::try_new(version).unwrap(),
            provides: Vec::new(),
            depends: Vec::new(),
            optional_depends: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn dep(text: &str) -> DependencyExpr {
        DependencyExpr::Spec(text.to_string())
    }

    fn req(text: &str) -> Requirement {
        Requirement::parse(text).unwrap()
    }

    struct Fixture {
        _dir: ScratchDir,
        lockfile_path: std::path::PathBuf,
        index: RepoIndex,
    }

    impl Fixture {
        fn new(candidates: Vec<Candidate>) -> Self {
            let dir = ScratchDir::new("fixture").unwrap();
            let lockfile_path = dir.path().join("dependency.lock.json");
            Self {
                _dir: dir,
                lockfile_path,
                index: RepoIndex::from_candidates(candidates),
            }
        }

        fn resolver(&self) -> DependencyResolver<'_> {
            DependencyResolver::new(&self.index, &self.lockfile_path)
        }
    }

    #[test]
    fn resolves_dependencies_in_order() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B>=1.0")];
        let fixture = Fixture::new(vec![a, candidate("B", "1.1")]);

        let result = fixture.resolver().resolve(&[req("A")], &ResolveOptions::default())?;
        assert!(result.ok, "{:?}", result.issues);
        assert_eq!(result.order, ["B-1.1", "A-1.0"]);
        assert_eq!(result.chosen["A"].id(), "A-1.0");
        assert_eq!(result.chosen["B"].id(), "B-1.1");
        Ok(())
    }

    #[test]
    fn reports_unsatisfied_version_constraints() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B>=1.0")];
        let fixture = Fixture::new(vec![a, candidate("B", "0.9")]);

        let result = fixture.resolver().resolve(&[req("A")], &ResolveOptions::default())?;
        assert!(!result.ok);
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.starts_with("unsatisfied:") && i.contains("B>=1.0")),
            "{:?}",
            result.issues
        );
        assert!(result.into_result().is_err());
        Ok(())
    }

    #[test]
    fn virtual_provider_choice_is_deterministic_and_lockable() -> Result<()> {
        let mut openssl = candidate("foo-openssl", "3.0");
        openssl.provides = vec!["libfoo".to_string()];
        let mut gnutls = candidate("foo-gnutls", "1.2");
        gnutls.provides = vec!["libfoo".to_string()];
        let fixture = Fixture::new(vec![openssl, gnutls]);

        let result = fixture
            .resolver()
            .resolve(&[req("libfoo")], &ResolveOptions::default())?;
        assert!(result.ok);
        // The higher version wins deterministically.
        assert_eq!(result.chosen["foo-openssl"].id(), "foo-openssl-3.0");

        // Pin the lockfile to the other provider; replay honors the pin.
        let mut lockfile = Lockfile::load(&fixture.lockfile_path);
        let mut pinned = BTreeMap::new();
        pinned.insert("foo-gnutls".to_string(), candidate("foo-gnutls", "1.2"));
        pinned.get_mut("foo-gnutls").unwrap().provides = vec!["libfoo".to_string()];
        lockfile.store(&[req("libfoo")], &pinned)?;

        let replay = fixture
            .resolver()
            .resolve(&[req("libfoo")], &ResolveOptions::default())?;
        assert!(replay.ok);
        assert_eq!(
            replay.chosen.keys().collect::<Vec<_>>(),
            ["foo-gnutls"]
        );
        Ok(())
    }

    #[test]
    fn resolution_is_idempotent_via_the_lockfile() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B"), dep("C")];
        let mut b = candidate("B", "2.0");
        b.depends = vec![dep("C")];
        let fixture = Fixture::new(vec![a, b, candidate("C", "3.0")]);

        let first = fixture
            .resolver()
            .resolve(&[req("A")], &ResolveOptions::default())?;
        let second = fixture
            .resolver()
            .resolve(&[req("A")], &ResolveOptions::default())?;
        assert!(first.ok && second.ok);
        assert_eq!(first.order, second.order);
        assert_eq!(
            first.chosen.keys().collect::<Vec<_>>(),
            second.chosen.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn order_respects_every_dependency_edge() -> Result<()> {
        // Diamond: app -> {libx, liby} -> zlib
        let mut app = candidate("app", "1.0");
        app.depends = vec![dep("libx"), dep("liby")];
        let mut libx = candidate("libx", "1.0");
        libx.depends = vec![dep("zlib")];
        let mut liby = candidate("liby", "1.0");
        liby.depends = vec![dep("zlib")];
        let fixture = Fixture::new(vec![app, libx, liby, candidate("zlib", "1.3")]);

        let result = fixture.resolver().resolve(&[req("app")], &ResolveOptions::default())?;
        assert!(result.ok);
        let position = |id: &str| result.order.iter().position(|o| o == id).unwrap();
        assert!(position("zlib-1.3") < position("libx-1.0"));
        assert!(position("zlib-1.3") < position("liby-1.0"));
        assert!(position("libx-1.0") < position("app-1.0"));
        assert!(position("liby-1.0") < position("app-1.0"));
        Ok(())
    }

    #[test]
    fn mutual_mandatory_cycle_terminates_with_issue() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B")];
        let mut b = candidate("B", "1.0");
        b.depends = vec![dep("A")];
        let fixture = Fixture::new(vec![a, b]);

        let result = fixture.resolver().resolve(&[req("A")], &ResolveOptions::default())?;
        assert!(result.ok);
        assert_eq!(result.order.len(), 2);
        assert_eq!(result.issues, ["cycle"]);
        Ok(())
    }

    #[test]
    fn optional_edges_break_cycles() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B")];
        let mut b = candidate("B", "1.0");
        b.optional_depends = vec![dep("A")];
        let fixture = Fixture::new(vec![a, b]);

        let options = ResolveOptions {
            allow_optional: true,
            ..Default::default()
        };
        let result = fixture.resolver().resolve(&[req("A")], &options)?;
        assert!(result.ok);
        assert_eq!(result.order, ["B-1.0", "A-1.0"]);
        assert!(result.issues.is_empty());
        Ok(())
    }

    #[test]
    fn conflicting_packages_cannot_coexist() -> Result<()> {
        let mut app = candidate("app", "1.0");
        app.depends = vec![dep("ssl-a"), dep("ssl-b")];
        let mut ssl_a = candidate("ssl-a", "1.0");
        ssl_a.conflicts = vec!["ssl-b".to_string()];
        let fixture = Fixture::new(vec![app, ssl_a, candidate("ssl-b", "1.0")]);

        let result = fixture.resolver().resolve(&[req("app")], &ResolveOptions::default())?;
        assert!(!result.ok);
        assert!(
            result.issues.iter().any(|i| i.starts_with("conflict:")),
            "{:?}",
            result.issues
        );
        Ok(())
    }

    #[test]
    fn missing_optional_dependencies_are_skipped() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.optional_depends = vec![dep("missing-extra")];
        let fixture = Fixture::new(vec![a]);

        let options = ResolveOptions {
            allow_optional: true,
            ..Default::default()
        };
        let result = fixture.resolver().resolve(&[req("A")], &options)?;
        assert!(result.ok, "{:?}", result.issues);
        assert_eq!(result.order, ["A-1.0"]);
        Ok(())
    }

    #[test]
    fn alternatives_accept_any_choice() -> Result<()> {
        let mut app = candidate("app", "1.0");
        app.depends = vec![DependencyExpr::Alternatives(vec![
            dep("libjpeg"),
            dep("libjpeg-turbo"),
        ])];
        // Only the second alternative exists.
        let fixture = Fixture::new(vec![app, candidate("libjpeg-turbo", "2.1")]);

        let result = fixture.resolver().resolve(&[req("app")], &ResolveOptions::default())?;
        assert!(result.ok, "{:?}", result.issues);
        assert!(result.chosen.contains_key("libjpeg-turbo"));
        Ok(())
    }

    #[test]
    fn step_limit_and_timeout_are_enforced() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B")];
        let fixture = Fixture::new(vec![a, candidate("B", "1.0")]);

        let options = ResolveOptions {
            max_steps: 1,
            prefer_locked: false,
            ..Default::default()
        };
        let result = fixture.resolver().resolve(&[req("A")], &options)?;
        assert!(!result.ok);
        assert_eq!(result.issues, ["step_limit"]);

        let options = ResolveOptions {
            timeout: Some(Duration::ZERO),
            prefer_locked: false,
            ..Default::default()
        };
        let result = fixture.resolver().resolve(&[req("A")], &options)?;
        assert!(!result.ok);
        assert_eq!(result.issues, ["timeout"]);
        Ok(())
    }

    #[test]
    fn explain_points_at_the_failure_mode() -> Result<()> {
        let fixture = Fixture::new(vec![candidate("zlib", "1.2")]);
        let resolver = fixture.resolver();

        let explanation = resolver.explain(&[req("nosuch")]);
        assert!(explanation.candidates["nosuch"].is_empty());
        assert!(explanation.tips[0].contains("No package provides nosuch"));

        let explanation = resolver.explain(&[req("zlib>=9.0")]);
        assert!(explanation.candidates["zlib"].is_empty());
        assert!(
            explanation.tips[0].contains("relax the version pins"),
            "{:?}",
            explanation.tips
        );
        Ok(())
    }

    #[test]
    fn names_in_order_reduces_ids() -> Result<()> {
        let mut a = candidate("A", "1.0");
        a.depends = vec![dep("B")];
        let fixture = Fixture::new(vec![a, candidate("B", "1.1")]);

        let result = fixture.resolver().resolve(&[req("A")], &ResolveOptions::default())?;
        assert_eq!(result.names_in_order(), ["B", "A"]);
        Ok(())
    }
}
