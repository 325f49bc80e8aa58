//! Query pools: a fixed array of hardware queries of one type.

use std::sync::Arc;

use lume_rhi::QueryType;

use crate::error::Result;
use crate::hw::{HwDevice, HwObject, QueryHandle};

pub struct QueryPool {
    device: Arc<dyn HwDevice>,
    ty: QueryType,
    queries: Vec<QueryHandle>,
}

impl QueryPool {
    pub(crate) fn new(device: Arc<dyn HwDevice>, ty: QueryType, count: u32) -> Result<Self> {
        let mut queries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match device.create_query(ty) {
                Ok(query) => queries.push(query),
                Err(e) => {
                    for query in queries {
                        device.release(HwObject::Query(query));
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { device, ty, queries })
    }

    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    pub fn count(&self) -> u32 {
        self.queries.len() as u32
    }

    pub fn query(&self, index: u32) -> Option<QueryHandle> {
        self.queries.get(index as usize).copied()
    }

    /// Bytes one resolved record occupies.
    pub fn result_size(&self) -> u64 {
        self.ty.result_size()
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        for query in &self.queries {
            self.device.release(HwObject::Query(*query));
        }
    }
}

impl std::fmt::Debug for QueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPool")
            .field("type", &self.ty)
            .field("count", &self.queries.len())
            .finish()
    }
}
