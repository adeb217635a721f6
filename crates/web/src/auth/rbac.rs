//! Role-Based Access Control (RBAC) system.
//!
//! Roles map to permission ids of the form `resource:action`. The table is
//! seeded once at startup and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use super::types::Principal;

pub const SYSADMIN: &str = "SYSADMIN";
pub const ADMIN: &str = "ADMIN";
pub const PROJECT_MANAGER: &str = "PROJECT_MANAGER";
pub const TEAM_MEMBER: &str = "TEAM_MEMBER";
pub const VIEWER: &str = "VIEWER";

/// A role that can be assigned to users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Unique role identifier (e.g., "ADMIN", "VIEWER")
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub description: String,
    /// Permissions granted by this role
    pub permissions: Vec<String>,
    /// Parent roles (for inheritance)
    #[serde(default)]
    pub inherits: Vec<String>,
}

impl Role {
    fn seed(id: &str, name: &str, description: &str, permissions: &[&str], inherits: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            inherits: inherits.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// A named set of role definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Version for tracking changes
    pub version: String,
    pub roles: Vec<Role>,
}

/// Policy engine for evaluating permissions
pub struct PolicyEngine {
    policies: Vec<Policy>,
    /// Compiled role -> permissions map, inheritance resolved
    role_permissions: HashMap<String, HashSet<String>>,
}

impl PolicyEngine {
    /// Engine loaded with the built-in role table.
    pub fn new() -> Self {
        Self::with_policy(default_policy())
    }

    pub fn with_policy(policy: Policy) -> Self {
        let mut engine = Self {
            policies: Vec::new(),
            role_permissions: HashMap::new(),
        };
        engine.add_policy(policy);
        engine
    }

    /// Add a policy and recompile permissions
    pub fn add_policy(&mut self, policy: Policy) {
        self.policies.push(policy);
        self.compile_permissions();
    }

    /// Compile role -> permission mappings with transitive inheritance
    fn compile_permissions(&mut self) {
        let roles: HashMap<&str, &Role> = self
            .policies
            .iter()
            .flat_map(|p| &p.roles)
            .map(|r| (r.id.as_str(), r))
            .collect();

        let mut compiled = HashMap::new();
        for id in roles.keys() {
            let mut perms = HashSet::new();
            let mut visited = HashSet::new();
            let mut stack = vec![*id];
            // Walk the inheritance graph; `visited` guards against cycles.
            while let Some(current) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if let Some(role) = roles.get(current) {
                    perms.extend(role.permissions.iter().cloned());
                    stack.extend(role.inherits.iter().map(String::as_str));
                }
            }
            compiled.insert(id.to_string(), perms);
        }
        self.role_permissions = compiled;
    }

    /// Get all permissions for a set of roles
    pub fn permissions_for_roles<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a String>,
    ) -> HashSet<String> {
        let mut perms = HashSet::new();
        for role in roles {
            if let Some(role_perms) = self.role_permissions.get(role) {
                perms.extend(role_perms.iter().cloned());
            }
        }
        perms
    }

    /// Whether the principal holds every permission in `required`.
    ///
    /// API-key scopes, when present, narrow what the owner's roles grant.
    /// An empty requirement is never satisfied.
    pub fn has_permission(&self, principal: &Principal, required: &[&str]) -> bool {
        self.first_missing(principal, required).is_none() && !required.is_empty()
    }

    /// The first permission in `required` the principal lacks.
    pub fn first_missing<'r>(&self, principal: &Principal, required: &[&'r str]) -> Option<&'r str> {
        let perms = self.permissions_for_roles(&principal.roles);
        required.iter().copied().find(|permission| {
            let by_role = grants(&perms, permission);
            let by_scope = principal.scopes.is_empty() || grants(&principal.scopes, permission);
            !(by_role && by_scope)
        })
    }

    /// Whether a holder of `assigner_roles` may hand out every role in
    /// `target_roles`: each target role's permissions must already be
    /// granted to the assigner.
    pub fn can_assign(&self, assigner_roles: &BTreeSet<String>, target_roles: &BTreeSet<String>) -> bool {
        let held = self.permissions_for_roles(assigner_roles);
        target_roles.iter().all(|role| match self.role_permissions.get(role) {
            Some(perms) => perms.iter().all(|p| grants(&held, p)),
            None => false,
        })
    }

    pub fn is_known_role(&self, role: &str) -> bool {
        self.role_permissions.contains_key(role)
    }

    /// Get all defined roles
    pub fn roles(&self) -> Vec<&Role> {
        self.policies.iter().flat_map(|p| &p.roles).collect()
    }

    /// Effective (inheritance-resolved) permissions of one role, sorted.
    pub fn effective_permissions(&self, role: &str) -> Vec<String> {
        let mut perms: Vec<String> = self
            .role_permissions
            .get(role)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        perms.sort();
        perms
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact match, `*`, or a `resource:*` wildcard.
fn grants<S>(perms: &S, permission: &str) -> bool
where
    S: PermissionSet,
{
    if perms.has("*") || perms.has(permission) {
        return true;
    }
    match permission.split_once(':') {
        Some((resource, _action)) => perms.has(&format!("{}:*", resource)),
        None => false,
    }
}

trait PermissionSet {
    fn has(&self, p: &str) -> bool;
}

impl PermissionSet for HashSet<String> {
    fn has(&self, p: &str) -> bool {
        self.contains(p)
    }
}

impl PermissionSet for BTreeSet<String> {
    fn has(&self, p: &str) -> bool {
        self.contains(p)
    }
}

/// The built-in role table
pub fn default_policy() -> Policy {
    Policy {
        id: "default".to_string(),
        name: "Default ProjectGate Policy".to_string(),
        description: "Built-in role table".to_string(),
        version: "1.0.0".to_string(),
        roles: vec![
            Role::seed(SYSADMIN, "System Administrator", "Full system access", &["*"], &[]),
            Role::seed(
                ADMIN,
                "Administrator",
                "Manages users and organization settings",
                &["user:create", "user:read", "rbac:read", "api_key:manage"],
                &[PROJECT_MANAGER],
            ),
            Role::seed(
                PROJECT_MANAGER,
                "Project Manager",
                "Owns projects and assigns work",
                &[
                    "project:create",
                    "project:update",
                    "project:delete",
                    "task:assign",
                    "kpi:read",
                ],
                &[TEAM_MEMBER],
            ),
            Role::seed(
                TEAM_MEMBER,
                "Team Member",
                "Works on tasks and documents",
                &[
                    "project:read",
                    "task:read",
                    "task:create",
                    "task:update",
                    "document:read",
                    "document:upload",
                    "api_key:manage",
                ],
                &[],
            ),
            Role::seed(
                VIEWER,
                "Viewer",
                "Read-only access",
                &["project:read", "task:read", "document:read"],
                &[],
            ),
        ],
    }
}
