//! Kernel-backed address set with a local membership snapshot.
//!
//! Mutations go to the packet filter first and are mirrored into the
//! snapshot only once the filter call succeeded, so [`AddressSet::contains`]
//! always reflects the last successful add/remove/flush. Reads never wait on
//! an in-flight external command: the snapshot is an `Arc<HashSet>` swapped
//! under a lock that is only held for the copy-on-write update itself.

use super::filter::PacketFilter;
use crate::error::PortgateResult;
use portgate_core::{Address, Family};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// A named allowlist mirrored into one ipset per enabled family.
pub struct AddressSet {
    name: String,
    families: Vec<Family>,
    filter: Arc<dyn PacketFilter>,
    /// Current membership; replaced copy-on-write.
    members: RwLock<Arc<HashSet<Address>>>,
    /// Add/remove take the read side, flush the write side.
    bulk: tokio::sync::RwLock<()>,
}

impl AddressSet {
    /// Create an empty set. The backing ipsets are created by the firewall
    /// baseline, not here.
    pub fn new(
        name: impl Into<String>,
        families: Vec<Family>,
        filter: Arc<dyn PacketFilter>,
    ) -> Self {
        Self {
            name: name.into(),
            families,
            filter,
            members: RwLock::new(Arc::new(HashSet::new())),
            bulk: tokio::sync::RwLock::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether addresses of `family` can be stored.
    pub fn accepts(&self, family: Family) -> bool {
        self.families.contains(&family)
    }

    /// Add `addr`. Adding a present member succeeds.
    pub async fn add(&self, addr: Address) -> PortgateResult<()> {
        let _bulk = self.bulk.read().await;
        self.filter.add_to_set(&self.name, addr).await?;
        let inserted = self.update(|m| m.insert(addr));
        info!(set = %self.name, addr = %addr, new = inserted, "address added");
        Ok(())
    }

    /// Remove `addr`. Removing an absent member succeeds.
    pub async fn remove(&self, addr: Address) -> PortgateResult<()> {
        let _bulk = self.bulk.read().await;
        self.filter.remove_from_set(&self.name, addr).await?;
        let removed = self.update(|m| m.remove(&addr));
        info!(set = %self.name, addr = %addr, present = removed, "address removed");
        Ok(())
    }

    /// Remove every member.
    ///
    /// Each family's ipset is flushed independently; members of a family
    /// whose flush succeeded leave the snapshot even if another family
    /// failed. The first failure is returned.
    pub async fn flush(&self) -> PortgateResult<()> {
        let _bulk = self.bulk.write().await;
        let mut first_err = None;
        for &family in &self.families {
            match self.filter.flush_set(&self.name, family).await {
                Ok(()) => {
                    self.update(|m| m.retain(|a| a.family() != family));
                }
                Err(e) => {
                    warn!(set = %self.name, ?family, error = %e, "flush failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(set = %self.name, "address set flushed");
                Ok(())
            }
        }
    }

    /// Add each of `addrs`, stopping at the first failure.
    pub async fn seed(&self, addrs: impl IntoIterator<Item = Address>) -> PortgateResult<()> {
        for addr in addrs {
            self.add(addr).await?;
        }
        Ok(())
    }

    /// Replace the snapshot with what the kernel sets currently hold.
    ///
    /// ipsets outlive the daemon, so members admitted before a restart stay
    /// admitted; this brings [`contains`](Self::contains) back in line.
    pub async fn load(&self) -> PortgateResult<usize> {
        let _bulk = self.bulk.write().await;
        let mut loaded = HashSet::new();
        for &family in &self.families {
            loaded.extend(self.filter.list_set(&self.name, family).await?);
        }
        let count = loaded.len();
        *self.members.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(loaded);
        info!(set = %self.name, members = count, "address set loaded from packet filter");
        Ok(count)
    }

    /// Cached membership check; no packet-filter round trip.
    pub fn contains(&self, addr: &Address) -> bool {
        self.snapshot().contains(addr)
    }

    /// Current membership.
    pub fn snapshot(&self) -> Arc<HashSet<Address>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Members in canonical sorted order.
    pub fn members(&self) -> Vec<Address> {
        let mut list: Vec<Address> = self.snapshot().iter().copied().collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    fn update<R>(&self, f: impl FnOnce(&mut HashSet<Address>) -> R) -> R {
        let mut guard = self.members.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortgateError;
    use crate::firewall::filter::{DryRunFilter, FilterFuture, Invocation};
    use std::time::Duration;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    /// Records like [`DryRunFilter`], but each flush takes a while.
    struct SlowFlush {
        inner: DryRunFilter,
    }

    impl PacketFilter for SlowFlush {
        fn run(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<()>> {
            Box::pin(async move {
                if inv.args.first().map(String::as_str) == Some("flush") {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                self.inner.run(inv).await
            })
        }

        fn probe(&self, inv: Invocation) -> FilterFuture<'_, bool> {
            self.inner.probe(inv)
        }

        fn query(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<String>> {
            self.inner.query(inv)
        }
    }

    fn set_with(filter: DryRunFilter) -> (Arc<DryRunFilter>, AddressSet) {
        let filter = Arc::new(filter);
        let set = AddressSet::new("allow", vec![Family::V4, Family::V6], filter.clone());
        (filter, set)
    }

    #[tokio::test]
    async fn add_then_remove() {
        let (_, set) = set_with(DryRunFilter::new());
        let a = addr("198.51.100.4");
        set.add(a).await.unwrap();
        assert!(set.contains(&a));
        set.remove(a).await.unwrap();
        assert!(!set.contains(&a));
    }

    #[tokio::test]
    async fn add_twice_is_idempotent() {
        let (_, set) = set_with(DryRunFilter::new());
        let a = addr("198.51.100.4");
        set.add(a).await.unwrap();
        set.add(a).await.unwrap();
        assert!(set.contains(&a));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn remove_absent_is_ok() {
        let (_, set) = set_with(DryRunFilter::new());
        set.remove(addr("198.51.100.9")).await.unwrap();
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn failed_add_leaves_snapshot_untouched() {
        let (_, set) = set_with(DryRunFilter::new().failing_on("ipset add"));
        let a = addr("198.51.100.4");
        let err = set.add(a).await.unwrap_err();
        assert!(matches!(err, PortgateError::ExternalTool { .. }));
        assert!(!set.contains(&a));
    }

    #[tokio::test]
    async fn flush_clears_both_families() {
        let (filter, set) = set_with(DryRunFilter::new());
        set.add(addr("198.51.100.4")).await.unwrap();
        set.add(addr("2001:db8::4")).await.unwrap();
        set.flush().await.unwrap();
        assert_eq!(set.len(), 0);
        let cmds = filter.commands();
        assert!(cmds.contains(&"ipset flush allow".to_string()));
        assert!(cmds.contains(&"ipset flush allow6".to_string()));
    }

    #[tokio::test]
    async fn add_waits_for_in_flight_flush() {
        let filter = Arc::new(SlowFlush {
            inner: DryRunFilter::new(),
        });
        let set = Arc::new(AddressSet::new("allow", vec![Family::V4], filter.clone()));
        let flushing = {
            let set = set.clone();
            tokio::spawn(async move { set.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let a = addr("198.51.100.4");
        set.add(a).await.unwrap();
        flushing.await.unwrap().unwrap();

        assert!(set.contains(&a));
        assert_eq!(
            filter.inner.commands(),
            vec!["ipset flush allow", "ipset add allow 198.51.100.4 -exist"]
        );
    }

    #[tokio::test]
    async fn partial_flush_keeps_failed_family() {
        let (_, set) = set_with(DryRunFilter::new().failing_on("flush allow6"));
        set.add(addr("198.51.100.4")).await.unwrap();
        set.add(addr("2001:db8::4")).await.unwrap();
        assert!(set.flush().await.is_err());
        assert_eq!(set.members(), vec![addr("2001:db8::4")]);
    }

    #[tokio::test]
    async fn seed_adds_each_address() {
        let (filter, set) = set_with(DryRunFilter::new());
        set.seed([addr("198.51.100.4"), addr("2001:db8::4")]).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(filter
            .commands()
            .contains(&"ipset add allow6 2001:db8::4 -exist".to_string()));
    }

    #[tokio::test]
    async fn load_replaces_snapshot() {
        let (filter, set) = set_with(DryRunFilter::new());
        set.add(addr("198.51.100.4")).await.unwrap();
        // The dry-run backend reports empty kernel sets.
        assert_eq!(set.load().await.unwrap(), 0);
        assert_eq!(set.len(), 0);
        assert!(filter.commands().contains(&"ipset list allow".to_string()));
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_updates() {
        let (_, set) = set_with(DryRunFilter::new());
        set.add(addr("198.51.100.4")).await.unwrap();
        let before = set.snapshot();
        set.add(addr("198.51.100.5")).await.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_distinct_adds_all_land() {
        let (_, set) = set_with(DryRunFilter::new());
        let set = Arc::new(set);
        let mut handles = Vec::new();
        for i in 1..=50u8 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                set.add(Address::parse(&format!("10.1.0.{i}")).unwrap()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(set.len(), 50);
    }
}
