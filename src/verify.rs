//! Host reference computation and result verification.

/// Computes `c[i] = a[i] + b[i]` on the host, wrapping on overflow.
///
/// Only the common length of the three slices is written.
pub fn vadd_host(a: &[u32], b: &[u32], c: &mut [u32]) {
    debug_assert!(a.len() == b.len() && b.len() == c.len());
    for (c, (a, b)) in c.iter_mut().zip(a.iter().zip(b)) {
        *c = a.wrapping_add(*b);
    }
}

/// The first index where the device result differs from the reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("software and hardware vadd do not match: {device}!={reference} at position {index}")]
pub struct Mismatch {
    /// The index.
    pub index: usize,
    /// The device result.
    pub device: u32,
    /// The reference result.
    pub reference: u32,
}

/** Finds the first mismatch.

Stops consuming both iterators at the first mismatch. Extra items of the longer iterator are
ignored.
*/
pub fn first_mismatch<D, R>(device: D, reference: R) -> Option<Mismatch>
where
    D: IntoIterator<Item = u32>,
    R: IntoIterator<Item = u32>,
{
    device
        .into_iter()
        .zip(reference)
        .enumerate()
        .find(|(_, (device, reference))| device != reference)
        .map(|(index, (device, reference))| Mismatch {
            index,
            device,
            reference,
        })
}

/** Compares the device result against the reference.

**errors**
- The first [`Mismatch`].
*/
pub fn verify(device: &[u32], reference: &[u32]) -> Result<(), Mismatch> {
    debug_assert_eq!(device.len(), reference.len());
    match first_mismatch(device.iter().copied(), reference.iter().copied()) {
        Some(mismatch) => {
            tracing::warn!(
                index = mismatch.index,
                device = mismatch.device,
                reference = mismatch.reference,
                "verification failed"
            );
            Err(mismatch)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::populate_inputs;
    use std::cell::Cell;

    #[test]
    fn vadd_host_populated() {
        let mut a = [0; 8];
        let mut b = [0; 8];
        let mut c = [0; 8];
        populate_inputs(&mut a, &mut b);
        vadd_host(&a, &b, &mut c);
        assert_eq!(c, [0, 3, 6, 9, 12, 15, 18, 21]);
    }

    #[test]
    fn vadd_host_wraps() {
        let mut c = [7; 3];
        vadd_host(&[u32::MAX, u32::MAX, 5], &[1, u32::MAX, 6], &mut c);
        assert_eq!(c, [0, u32::MAX - 1, 11]);
    }

    #[test]
    fn vadd_host_single() {
        let mut c = [0];
        vadd_host(&[40], &[2], &mut c);
        assert_eq!(c, [42]);
    }

    #[test]
    fn vadd_host_matches_wrapping_sum() {
        let a: Vec<u32> = (0..1000u32).map(|x| x.wrapping_mul(2_654_435_761)).collect();
        let b: Vec<u32> = (0..1000u32).map(|x| x.wrapping_mul(40_503).rotate_left(7)).collect();
        let mut c = vec![0; 1000];
        vadd_host(&a, &b, &mut c);
        for i in 0..1000 {
            assert_eq!(c[i] as u64, (a[i] as u64 + b[i] as u64) % (1 << 32));
        }
    }

    #[test]
    fn verify_match() {
        let x = [0, 3, 6, 9, 12, 15, 18, 21];
        assert_eq!(verify(&x, &x), Ok(()));
    }

    #[test]
    fn verify_first_mismatch() {
        let reference = [0, 3, 6, 9, 12, 15, 18, 21];
        let device = [0, 3, 6, 0, 12, 0, 18, 21];
        assert_eq!(
            verify(&device, &reference),
            Err(Mismatch {
                index: 3,
                device: 0,
                reference: 9,
            })
        );
    }

    #[test]
    fn first_mismatch_stops() {
        let inspected = Cell::new(0);
        let reference = [0, 3, 6, 9, 12, 15, 18, 21];
        let device = [0, 3, 6, 0, 12, 15, 18, 21];
        let mismatch = first_mismatch(
            device.iter().copied().inspect(|_| inspected.set(inspected.get() + 1)),
            reference,
        );
        assert_eq!(mismatch.map(|x| x.index), Some(3));
        assert_eq!(inspected.get(), 4);
    }

    #[test]
    fn mismatch_display() {
        let mismatch = Mismatch {
            index: 3,
            device: 0,
            reference: 9,
        };
        assert_eq!(
            mismatch.to_string(),
            "software and hardware vadd do not match: 0!=9 at position 3"
        );
    }
}
