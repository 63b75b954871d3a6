use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type NodeId = String;

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    /// Names this node runs after. A trailing `?` marks the edge optional:
    /// it is dropped when no node of that name was registered.
    pub after: Vec<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, after: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            after,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Plan {
    nodes: BTreeMap<NodeId, Node>,
}

impl Plan {
    pub fn add(&mut self, node: Node) -> Result<()> {
        if node.id.trim().is_empty() {
            return Err(Error::permanent("component name is empty"));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(Error::permanent(format!(
                "duplicate component name '{}'",
                node.id
            )));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn resolve_dep<'a>(&'a self, owner: &str, dep: &'a str) -> Result<Option<&'a str>> {
        let (name, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if let Some((k, _)) = self.nodes.get_key_value(name) {
            return Ok(Some(k.as_str()));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::permanent(format!(
            "component '{owner}' depends on unknown component '{name}'"
        )))
    }

    /// Resolved (non-optional-missing) dependencies of `id`.
    pub fn deps_of(&self, id: &str) -> Result<Vec<&str>> {
        let Some(node) = self.nodes.get(id) else {
            return Err(Error::permanent(format!("unknown component '{id}'")));
        };
        let mut out = Vec::new();
        for dep in &node.after {
            if let Some(d) = self.resolve_dep(id, dep)? {
                if d == id {
                    return Err(Error::permanent(format!(
                        "component '{id}' depends on itself"
                    )));
                }
                if !out.contains(&d) {
                    out.push(d);
                }
            }
        }
        Ok(out)
    }

    /// Reverse adjacency: node -> nodes that directly depend on it.
    pub fn dependents(&self) -> Result<BTreeMap<&str, BTreeSet<&str>>> {
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for id in self.nodes.keys() {
            outgoing.entry(id.as_str()).or_default();
        }
        for id in self.nodes.keys() {
            for dep in self.deps_of(id)? {
                outgoing.entry(dep).or_default().insert(id.as_str());
            }
        }
        Ok(outgoing)
    }

    /// Every node that transitively depends on `id` (not including `id`).
    pub fn dependents_closure(&self, id: &str) -> Result<BTreeSet<String>> {
        let outgoing = self.dependents()?;
        let mut seen = BTreeSet::<String>::new();
        let mut q: VecDeque<&str> = VecDeque::from([id]);
        while let Some(n) = q.pop_front() {
            if let Some(children) = outgoing.get(n) {
                for &c in children {
                    if seen.insert(c.to_string()) {
                        q.push_back(c);
                    }
                }
            }
        }
        Ok(seen)
    }

    /// Topological order (Kahn). Ties among ready nodes break by name.
    pub fn ordered(&self) -> Result<Vec<&Node>> {
        let outgoing = self.dependents()?;
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        for id in self.nodes.keys() {
            incoming.insert(id.as_str(), self.deps_of(id)?.len());
        }

        let mut ready: BTreeSet<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.nodes.len());

        while let Some(n) = ready.pop_first() {
            out.push(n);
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            ready.insert(m);
                        }
                    }
                }
            }
        }

        if out.len() != self.nodes.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::permanent(format!(
                "dependency cycle among components: {}",
                remaining.join(", ")
            )));
        }

        Ok(out.into_iter().filter_map(|id| self.nodes.get(id)).collect())
    }

    /// Sub-plan holding `roots` and everything they transitively depend on.
    pub fn select(&self, roots: &[String]) -> Result<Plan> {
        let mut keep = BTreeSet::<String>::new();
        let mut q: VecDeque<String> = VecDeque::new();
        for r in roots {
            if !self.nodes.contains_key(r) {
                return Err(Error::permanent(format!("unknown component '{r}'")));
            }
            q.push_back(r.clone());
        }
        while let Some(n) = q.pop_front() {
            if !keep.insert(n.clone()) {
                continue;
            }
            for d in self.deps_of(&n)? {
                q.push_back(d.to_string());
            }
        }
        let mut sub = Plan::default();
        for id in keep {
            if let Some(node) = self.nodes.get(&id) {
                sub.add(node.clone())?;
            }
        }
        Ok(sub)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph converge {\n  rankdir=LR;\n");
        for node in self.nodes.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                node.id, node.id, node.kind
            ));
        }
        for node in self.nodes.values() {
            for dep in self.deps_of(&node.id)? {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, node.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
