use crate::axes::Axes;
use crate::error::{Error, Result};

/// Which axes the engine pools when computing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchNormMode {
    /// Statistics per activation, averaged over the batch axis only.
    /// Parameters are shaped (1, C, H, W) / (1, C, D, H, W).
    PerActivation,
    /// Statistics per channel, averaged over batch and spatial axes.
    /// Parameters are shaped (1, C, 1, 1) / (1, C, 1, 1, 1).
    Spatial,
}

impl BatchNormMode {
    /// Resolve the mode for a reduction axis set.
    ///
    /// `(0)` is per-activation; `(0, 2, 3)` and `(0, 2, 3, 4)` are spatial.
    /// Every other set is rejected.
    pub fn from_axes(axes: &Axes) -> Result<Self> {
        match axes.as_slice() {
            [0] => Ok(BatchNormMode::PerActivation),
            [0, 2, 3] | [0, 2, 3, 4] => Ok(BatchNormMode::Spatial),
            _ => Err(Error::Dimension { axes: axes.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_supported_axes() {
        assert_eq!(
            BatchNormMode::from_axes(&Axes::from([0])).unwrap(),
            BatchNormMode::PerActivation
        );
        assert_eq!(
            BatchNormMode::from_axes(&Axes::from([0, 2, 3])).unwrap(),
            BatchNormMode::Spatial
        );
        assert_eq!(
            BatchNormMode::from_axes(&Axes::from([0, 2, 3, 4])).unwrap(),
            BatchNormMode::Spatial
        );
    }

    #[test]
    fn test_rejected_axes() {
        for axes in [
            vec![],
            vec![1],
            vec![0, 2],
            vec![0, 1, 2, 3],
            vec![0, 3, 2],
            vec![0, 2, 3, 4, 5],
        ] {
            let axes = Axes::new(axes);
            match BatchNormMode::from_axes(&axes) {
                Err(Error::Dimension { axes: got }) => assert_eq!(got, axes),
                other => panic!("expected dimension error for {axes}, got {other:?}"),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_only_three_axis_sets_resolve(axes in proptest::collection::vec(0usize..6, 0..6)) {
            let supported = axes == [0] || axes == [0, 2, 3] || axes == [0, 2, 3, 4];
            let resolved = BatchNormMode::from_axes(&Axes::new(axes.clone()));
            prop_assert_eq!(resolved.is_ok(), supported);
            // Same input, same answer.
            let again = BatchNormMode::from_axes(&Axes::new(axes));
            prop_assert_eq!(resolved.ok(), again.ok());
        }
    }
}
