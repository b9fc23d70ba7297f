use std::collections::{HashMap, HashSet, VecDeque};

/// Default bound on how many inheritance levels are followed.
pub const DEFAULT_MAX_HIERARCHY_LEVEL: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RoleEdge {
    role: String,
    domain: Option<String>,
}

/// Directed member -> role graph for one role definition (`g`, `g2`, ...).
///
/// Links may be cyclic; resolution never expands a role twice.
#[derive(Debug, Clone)]
pub struct RoleManager {
    edges: HashMap<String, Vec<RoleEdge>>,
    max_hierarchy_level: usize,
    link_count: usize,
}

impl Default for RoleManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HIERARCHY_LEVEL)
    }
}

impl RoleManager {
    pub fn new(max_hierarchy_level: usize) -> Self {
        Self {
            edges: HashMap::new(),
            max_hierarchy_level,
            link_count: 0,
        }
    }

    pub fn add_link(&mut self, member: &str, role: &str, domain: Option<&str>) {
        let edge = RoleEdge {
            role: role.to_string(),
            domain: domain.map(str::to_string),
        };
        let edges = self.edges.entry(member.to_string()).or_default();
        if !edges.contains(&edge) {
            edges.push(edge);
            self.link_count += 1;
        }
    }

    /// Direct roles of `member` in `domain` (or without a domain).
    pub fn direct_roles<'a>(
        &'a self,
        member: &str,
        domain: Option<&'a str>,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .get(member)
            .into_iter()
            .flatten()
            .filter(move |e| e.domain.as_deref() == domain)
            .map(|e| e.role.as_str())
    }

    /// Every role `member` inherits, transitively, breadth-first.
    /// `member` itself is not part of the result unless a cycle leads back to it.
    pub fn roles_for(&self, member: &str, domain: Option<&str>) -> HashSet<String> {
        let mut roles = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        visited.insert(member);
        queue.push_back((member, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= self.max_hierarchy_level {
                continue;
            }
            for role in self.direct_roles(current, domain) {
                roles.insert(role.to_string());
                if visited.insert(role) {
                    queue.push_back((role, depth + 1));
                }
            }
        }

        roles
    }

    /// True when `member == role` or `member` inherits `role`.
    pub fn has_link(&self, member: &str, role: &str, domain: Option<&str>) -> bool {
        member == role || self.roles_for(member, domain).contains(role)
    }

    pub fn link_count(&self) -> usize {
        self.link_count
    }
}
