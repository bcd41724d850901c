use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

use bp_error::{BpResult, bp_bail};

use crate::dtype::{DataType, NativeType};
use crate::operator::{Operator, OperatorParams};
use crate::schema::ShapeKind;
use crate::selection::BoxRegion;

/// The shape a variable is declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    GlobalValue,
    LocalValue,
    /// A global array of the given dimensions; every block is placed inside it.
    GlobalArray(Vec<u64>),
    /// Per-writer arrays with no global shape.
    LocalArray,
}

impl Shape {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::GlobalValue => ShapeKind::GlobalValue,
            Self::LocalValue => ShapeKind::LocalValue,
            Self::GlobalArray(_) => ShapeKind::GlobalArray,
            Self::LocalArray => ShapeKind::LocalArray,
        }
    }

    /// Check that `block` is a valid block of a variable of this shape.
    pub(crate) fn check_block(&self, name: &str, block: &BoxRegion) -> BpResult<()> {
        match self {
            Self::GlobalValue | Self::LocalValue => {
                if block.ndims() != 0 {
                    bp_bail!(
                        InvalidArgument: "{name} is a single value, got a {}-d block",
                        block.ndims()
                    );
                }
            }
            Self::GlobalArray(shape) => {
                if !block.fits_in(shape) {
                    bp_bail!(
                        InvalidArgument: "block {:?}+{:?} does not fit {name} of shape {shape:?}",
                        block.start,
                        block.count
                    );
                }
            }
            Self::LocalArray => {
                if block.ndims() == 0 {
                    bp_bail!(InvalidArgument: "{name} is an array, got a 0-d block");
                }
            }
        }
        Ok(())
    }
}

/// A typed handle to a variable of one [`crate::BpWriter`].
pub struct Variable<T> {
    pub(crate) id: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T> Variable<T> {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            _type: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Variable<T> {}

impl<T: NativeType> Debug for Variable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("dtype", &T::DTYPE)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VarDef {
    pub(crate) name: String,
    pub(crate) dtype: DataType,
    pub(crate) shape: Shape,
    pub(crate) operation: Option<(Arc<dyn Operator>, OperatorParams)>,
}
