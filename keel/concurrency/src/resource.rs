use std::fmt;

/// Hierarchical name of a lockable resource, e.g. `database/orders/page 7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    names: Vec<String>,
}

impl ResourceName {
    /// Name of a root resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    /// Name of the child `name` of this resource.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut names = self.names.clone();
        names.push(name.into());
        Self { names }
    }

    /// Name of the parent resource, `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        if self.names.len() <= 1 {
            return None;
        }
        Some(Self {
            names: self.names[..self.names.len() - 1].to_vec(),
        })
    }

    /// True if this resource lies strictly below `other`.
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.names.len() > other.names.len() && self.names.starts_with(&other.names)
    }

    /// Path components from the root down.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The last path component.
    pub fn leaf(&self) -> &str {
        self.names.last().map(String::as_str).unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.names.len()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_and_parent() {
        let db = ResourceName::new("database");
        let table = db.child("orders");
        let page = table.child("page 3");

        assert_eq!(page.to_string(), "database/orders/page 3");
        assert_eq!(page.parent(), Some(table.clone()));
        assert_eq!(table.parent(), Some(db.clone()));
        assert_eq!(db.parent(), None);
        assert_eq!(page.leaf(), "page 3");
        assert_eq!(page.depth(), 3);
    }

    #[test]
    fn test_descendants() {
        let db = ResourceName::new("database");
        let orders = db.child("orders");
        let page = orders.child("page 3");
        let other = db.child("order");

        assert!(page.is_descendant_of(&db));
        assert!(page.is_descendant_of(&orders));
        assert!(!orders.is_descendant_of(&orders));
        assert!(!db.is_descendant_of(&orders));
        // Component-wise, not string-prefix comparison.
        assert!(!orders.is_descendant_of(&other));
    }
}
