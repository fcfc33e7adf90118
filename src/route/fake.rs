//! In-memory [`RouteTable`] for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{NodeRoute, RouteTable};
use crate::error::{CniError, Result};

/// Route table that can be told to fail for chosen destinations.
#[derive(Default)]
pub struct FakeRoutes {
    pub table: Mutex<BTreeMap<String, NodeRoute>>,
    pub fail_on: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeRoutes {
    pub fn with(routes: &[NodeRoute]) -> Self {
        let fake = Self::default();
        fake.table.lock().unwrap().extend(routes.iter().map(|r| (r.key(), r.clone())));
        fake
    }

    pub fn installed(&self) -> Vec<NodeRoute> {
        self.table.lock().unwrap().values().cloned().collect()
    }

    fn record(&self, op: &str, route: &NodeRoute) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{} {}", op, route.key()));
        if self.fail_on.lock().unwrap().contains(&route.key()) {
            return Err(CniError::kernel(format!("ip route {}", op), "Network is unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RouteTable for FakeRoutes {
    async fn list(&self, link: &str) -> Result<Vec<NodeRoute>> {
        Ok(self.installed().into_iter().filter(|r| r.link == link).collect())
    }

    async fn add(&self, route: &NodeRoute) -> Result<()> {
        self.record("add", route)?;
        self.table.lock().unwrap().insert(route.key(), route.clone());
        Ok(())
    }

    async fn replace(&self, route: &NodeRoute) -> Result<()> {
        self.record("replace", route)?;
        self.table.lock().unwrap().insert(route.key(), route.clone());
        Ok(())
    }

    async fn delete(&self, route: &NodeRoute) -> Result<()> {
        self.record("del", route)?;
        self.table.lock().unwrap().remove(&route.key());
        Ok(())
    }
}
