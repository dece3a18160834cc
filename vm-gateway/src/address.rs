//! Address allocator contract.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Reserve the first free address in `subnet_id` for `hostname`.
    ///
    /// Fails with `NoAddressAvailable` or `AllocatorUnavailable`.
    async fn allocate(&self, subnet_id: i64, hostname: &str) -> Result<String>;

    /// Give an address back to the subnet. Releasing an address that is not
    /// held succeeds.
    async fn release(&self, subnet_id: i64, ip: &str) -> Result<()>;
}
