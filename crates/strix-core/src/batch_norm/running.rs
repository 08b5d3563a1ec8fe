use crate::array::Array;
use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::Result;

/// A running statistic as handed to the forward-training primitive.
///
/// If the caller's buffer already has the engine parameter dtype the engine
/// updates it in place. Otherwise the engine updates a casted copy, and
/// [`RunningStat::write_back`] casts the result back and copies its bytes
/// into the caller's buffer. Gradients in backward are always cast back;
/// running statistics only when a cast actually happened.
pub(crate) enum RunningStat<'a, B: Backend> {
    InPlace(&'a mut Array<B>),
    Casted {
        original: &'a mut Array<B>,
        casted: Array<B>,
    },
}

impl<'a, B: Backend> RunningStat<'a, B> {
    pub(crate) fn prepare(running: &'a mut Array<B>, dtype: DType) -> Result<Self> {
        if running.dtype() == dtype {
            return Ok(RunningStat::InPlace(running));
        }
        let casted = running.as_type(dtype)?;
        Ok(RunningStat::Casted {
            original: running,
            casted,
        })
    }

    pub(crate) fn storage_mut(&mut self) -> &mut B::Storage {
        match self {
            RunningStat::InPlace(running) => running.storage_mut(),
            RunningStat::Casted { casted, .. } => casted.storage_mut(),
        }
    }

    pub(crate) fn write_back(self) -> Result<()> {
        match self {
            RunningStat::InPlace(_) => Ok(()),
            RunningStat::Casted { original, casted } => {
                debug_assert!(original.is_contiguous());
                tracing::trace!(
                    from = %casted.dtype(),
                    to = %original.dtype(),
                    "writing back casted running statistic"
                );
                let casted_back = casted.as_type(original.dtype())?;
                original.copy_bytes_from(&casted_back)
            }
        }
    }
}
