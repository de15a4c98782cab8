use super::{
    check_argnum, make_derivative, Derivative, DerivativeSettings, Differentiable, Differential,
    JacobianEstimator, Mode,
};
use crate::error::{Error, Result};
use crate::traits::{ArgFunction, Scalar};
use nalgebra::{DMatrix, DVector};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// How the output rows are partitioned. Exactly one of the two is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSpec {
    /// Rows per block; the last block may be shorter.
    Size(usize),
    /// Number of blocks; rows per block is `ceil(rows / count)`.
    Count(usize),
}

impl BlockSpec {
    pub fn from_options(block_size: Option<usize>, num_blocks: Option<usize>) -> Result<Self> {
        match (block_size, num_blocks) {
            (Some(size), None) => Ok(BlockSpec::Size(size)),
            (None, Some(count)) => Ok(BlockSpec::Count(count)),
            (Some(_), Some(_)) => Err(Error::invalid_config(
                "block jacobian",
                "specify block_size or num_blocks, not both",
            )),
            (None, None) => Err(Error::invalid_config(
                "block jacobian",
                "one of block_size or num_blocks is required",
            )),
        }
    }

    /// Contiguous row ranges covering `0..rows` in order.
    pub fn partition(&self, rows: usize) -> Result<Vec<Range<usize>>> {
        let size = match *self {
            BlockSpec::Size(0) | BlockSpec::Count(0) => {
                return Err(Error::invalid_config(
                    "block jacobian",
                    format!("{self:?} must be positive"),
                ))
            }
            BlockSpec::Size(size) => size,
            BlockSpec::Count(count) => rows.div_ceil(count).max(1),
        };
        Ok((0..rows)
            .step_by(size)
            .map(|start| start..(start + size).min(rows))
            .collect())
    }
}

/// Where a block is evaluated.
#[derive(Clone)]
pub enum Device {
    /// The calling thread.
    Current,
    /// A dedicated rayon pool.
    Pool(Arc<ThreadPool>),
}

impl Device {
    pub fn pool(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::invalid_config("block jacobian device", e.to_string()))?;
        Ok(Device::Pool(Arc::new(pool)))
    }

    fn run<R: Send>(&self, job: impl FnOnce() -> R + Send) -> R {
        match self {
            Device::Current => job(),
            Device::Pool(pool) => pool.install(job),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Current => f.write_str("Current"),
            Device::Pool(pool) => write!(f, "Pool({} threads)", pool.current_num_threads()),
        }
    }
}

/// Restricts a function to a contiguous range of its outputs.
struct RowBlock<'a, F> {
    fun: &'a F,
    rows: Range<usize>,
}

impl<T: Scalar, F: ArgFunction<T>> ArgFunction<T> for RowBlock<'_, F> {
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
        let mut out = self.fun.call(args)?;
        if out.len() < self.rows.end {
            return Err(Error::dimension(
                "block jacobian output",
                format!("at least {}", self.rows.end),
                out.len(),
            ));
        }
        out.truncate(self.rows.end);
        Ok(out.split_off(self.rows.start))
    }
}

/// Jacobian assembled from independently differentiated row blocks.
///
/// Block `k` runs on `devices[k % devices.len()]`; blocks are concatenated in
/// order, so the result matches the unblocked Jacobian.
pub struct BlockJacobian<F> {
    fun: F,
    argnum: usize,
    blocks: Vec<Range<usize>>,
    devices: Vec<Device>,
    settings: DerivativeSettings,
}

impl<F: Differentiable + Sync> BlockJacobian<F> {
    pub fn new(
        fun: F,
        argnum: usize,
        dim_f: usize,
        spec: BlockSpec,
        devices: Vec<Device>,
        settings: DerivativeSettings,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::invalid_config(
                "block jacobian",
                "at least one device must be supplied",
            ));
        }
        let blocks = spec.partition(dim_f)?;
        log::debug!(
            "block jacobian: {} rows in {} blocks over {} devices",
            dim_f,
            blocks.len(),
            devices.len()
        );
        Ok(Self {
            fun,
            argnum,
            blocks,
            devices,
            settings,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block_mode(&self) -> Mode {
        // Short, wide blocks favour the reverse sweep.
        Mode::Rev
    }

    fn assemble(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        check_argnum(self.argnum, args)?;
        let n = args[self.argnum].len();
        let dim_f = self.blocks.last().map_or(0, |b| b.end);
        let mut jacobian = DMatrix::zeros(dim_f, n);

        for (k, rows) in self.blocks.iter().enumerate() {
            let device = &self.devices[k % self.devices.len()];
            let block = RowBlock {
                fun: &self.fun,
                rows: rows.clone(),
            };
            let settings = self.settings;
            let (argnum, mode) = (self.argnum, self.block_mode());
            let part = device.run(move || -> Result<DMatrix<f64>> {
                let handle = make_derivative(&settings, block, argnum, mode)?;
                Ok(handle.compute(args)?.into_matrix())
            })?;
            if part.nrows() != rows.len() || part.ncols() != n {
                return Err(Error::dimension(
                    format!("block {k} of jacobian"),
                    format!("{}x{}", rows.len(), n),
                    part.nrows() * part.ncols(),
                ));
            }
            jacobian.rows_mut(rows.start, rows.len()).copy_from(&part);
        }
        Ok(jacobian)
    }
}

impl<F: Differentiable + Sync> Derivative for BlockJacobian<F> {
    fn mode(&self) -> Mode {
        Mode::Fwd
    }

    fn argnum(&self) -> usize {
        self.argnum
    }

    fn compute(&self, args: &[DVector<f64>]) -> Result<Differential> {
        Ok(Differential::from_jacobian(self.assemble(args)?))
    }
}

impl<F: Differentiable + Sync> JacobianEstimator for BlockJacobian<F> {
    fn jacobian(&mut self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        self.assemble(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::test_functions::Linear;
    use crate::derivatives::AutoDiffDerivative;

    fn linear(rows: usize, cols: usize) -> Linear {
        Linear {
            rows,
            cols,
            entries: (0..rows * cols).map(|k| ((k * 7 % 11) as f64) - 5.0).collect(),
        }
    }

    #[test]
    fn partition_covers_rows_in_order() {
        let size = BlockSpec::Size(3).partition(7).expect("partition");
        assert_eq!(size, vec![0..3, 3..6, 6..7]);
        let count = BlockSpec::Count(3).partition(7).expect("partition");
        assert_eq!(count, vec![0..3, 3..6, 6..7]);
        assert!(BlockSpec::Size(0).partition(4).is_err());
    }

    #[test]
    fn both_block_options_are_rejected() {
        let err = BlockSpec::from_options(Some(2), Some(3)).expect_err("both given");
        assert!(format!("{err}").contains("not both"));
    }

    #[test]
    fn block_jacobian_matches_unblocked() {
        let x = DVector::from_vec(vec![0.5, -1.0, 2.0, 0.25]);
        let full = AutoDiffDerivative::new(linear(7, 4), 0, Mode::Fwd)
            .compute(&[x.clone()])
            .expect("full jacobian")
            .into_matrix();

        let devices = vec![Device::Current, Device::pool(2).expect("pool")];
        for spec in [BlockSpec::Size(2), BlockSpec::Count(3), BlockSpec::Size(10)] {
            let blocked =
                BlockJacobian::new(linear(7, 4), 0, 7, spec, devices.clone(), Default::default())
                    .expect("block jacobian")
                    .compute(&[x.clone()])
                    .expect("blocked")
                    .into_matrix();
            assert!((&blocked - &full).amax() < 1e-14, "{spec:?}");
        }
    }

    #[test]
    fn empty_device_list_is_rejected() {
        let err = BlockJacobian::new(
            linear(2, 2),
            0,
            2,
            BlockSpec::Size(1),
            Vec::new(),
            Default::default(),
        )
        .err()
        .expect("no devices");
        assert!(format!("{err}").contains("device"));
    }
}
