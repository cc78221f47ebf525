use crate::error::BankError;
use crate::process_image::BankKind;

/// Fixed-size, zero-based store of bits or words.
///
/// The initializer runs once per address in ascending order, so contents
/// depend only on the address and the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank<T> {
    kind: BankKind,
    values: Box<[T]>,
}

impl<T: Copy> RegisterBank<T> {
    pub fn new<F>(kind: BankKind, capacity: usize, initializer: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        Self {
            kind,
            values: (0..capacity).map(initializer).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, address: usize) -> Result<T, BankError> {
        self.values
            .get(address)
            .copied()
            .ok_or_else(|| self.out_of_range(address))
    }

    /// Reads `count` consecutive values starting at `address`.
    pub fn range(&self, address: usize, count: usize) -> Result<Vec<T>, BankError> {
        let end = address
            .checked_add(count)
            .ok_or_else(|| self.out_of_range(address))?;
        if end > self.values.len() {
            return Err(self.out_of_range(end.saturating_sub(1).max(address)));
        }
        Ok(self.values[address..end].to_vec())
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    fn out_of_range(&self, address: usize) -> BankError {
        BankError::OutOfRange {
            kind: self.kind,
            address,
            capacity: self.values.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initializer_runs_in_address_order() {
        let mut seen = Vec::new();
        let bank = RegisterBank::new(BankKind::InputRegisters, 4, |address| {
            seen.push(address);
            address as u16 * 10
        });

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(bank.values(), &[0, 10, 20, 30]);
        assert_eq!(bank.capacity(), 4);
    }

    #[test]
    fn test_get_out_of_range() {
        let bank = RegisterBank::new(BankKind::DiscreteInputs, 2, |address| address % 2 == 0);

        assert_eq!(bank.get(1), Ok(false));
        assert_eq!(
            bank.get(2),
            Err(BankError::OutOfRange {
                kind: BankKind::DiscreteInputs,
                address: 2,
                capacity: 2,
            })
        );
    }

    #[test]
    fn test_empty_bank_rejects_everything() {
        let bank = RegisterBank::new(BankKind::DiscreteOutputs, 0, |_| true);

        assert!(bank.get(0).is_err());
        assert!(bank.range(0, 1).is_err());
        assert_eq!(bank.range(0, 0), Ok(vec![]));
    }

    #[test]
    fn test_range_bounds() {
        let bank = RegisterBank::new(BankKind::HoldingRegisters, 3, |address| address as u16);

        assert_eq!(bank.range(1, 2), Ok(vec![1, 2]));
        assert!(matches!(
            bank.range(2, 2),
            Err(BankError::OutOfRange { address: 3, .. })
        ));
        assert!(bank.range(usize::MAX, 2).is_err());
    }
}
