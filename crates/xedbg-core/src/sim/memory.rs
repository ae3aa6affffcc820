use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::backend::Memory;
use crate::types::GuestAddress;

/// Big-endian guest memory made of independently mapped regions.
#[derive(Debug, Default)]
pub struct SimMemory
{
    regions: RwLock<BTreeMap<u32, Vec<u8>>>,
}

impl SimMemory
{
    /// Create memory with nothing mapped.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Map a region at `base` holding `words`, replacing any region that
    /// started at the same address.
    pub fn load_words(&self, base: GuestAddress, words: &[u32])
    {
        let bytes = words.iter().flat_map(|word| word.to_be_bytes()).collect();
        self.regions.write().unwrap_or_else(PoisonError::into_inner).insert(base.value(), bytes);
    }

    /// Map `size` zeroed bytes at `base`.
    pub fn map_zeroed(&self, base: GuestAddress, size: usize)
    {
        self.regions.write().unwrap_or_else(PoisonError::into_inner).insert(base.value(), vec![0; size]);
    }

    /// Store a word. Returns `false` when the address is not mapped.
    pub fn store_u32(&self, address: GuestAddress, value: u32) -> bool
    {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let Some((base, bytes)) = regions.range_mut(..=address.value()).next_back() else {
            return false;
        };
        let offset = (address.value() - *base) as usize;
        match bytes.get_mut(offset..offset + 4) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_be_bytes());
                true
            }
            None => false,
        }
    }
}

impl Memory for SimMemory
{
    fn load_u32(&self, address: GuestAddress) -> Option<u32>
    {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let (base, bytes) = regions.range(..=address.value()).next_back()?;
        let offset = (address.value() - base) as usize;
        let word: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(word))
    }
}
