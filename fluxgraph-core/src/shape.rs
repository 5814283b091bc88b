use std::{cell::Cell, fmt, rc::Rc};

use crate::{bail_value, Result};

/// Compile-time spelled shapes, handy for building metas: `R2::<3, 4>::shape()`.
pub trait Shape {
    fn shape() -> Vec<usize>;
    fn element_count() -> usize {
        Self::shape().iter().product()
    }
}

macro_rules! shape {
    (($($C:ident),*), ($($N:tt),*), $name:ident) => {
        pub struct $name<$($C $N: usize, )*>;

        impl<$($C $N: usize, )*> Shape for $name<$({ $N }, )*> {
            fn shape() -> Vec<usize> {
                vec![$($N, )*]
            }
        }
    };
}

shape!((const), (A), R1);
shape!((const, const), (A, B), R2);
shape!((const, const, const), (A, B, C), R3);
shape!((const, const, const, const), (A, B, C, D), R4);
shape!((const, const, const, const, const), (A, B, C, D, E), R5);
shape!((const, const, const, const, const, const), (A, B, C, D, E, F), R6);

/// Number of elements in a tensor of the given dims. Scalars (`[]`) hold one.
pub fn numel(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Row-major strides for `dims`.
pub(crate) fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc = 1;
    for dim in dims.iter().rev() {
        strides.push(acc);
        acc *= *dim;
    }
    strides.reverse();
    strides
}

/// One dimension of a [`SymbolicShape`].
///
/// Clones share the same binding, so every tensor that copied a symbol sees a
/// new value as soon as it is bound.
#[derive(Clone)]
pub struct IntSymbol {
    name: Rc<str>,
    value: Rc<Cell<usize>>,
}

impl IntSymbol {
    pub fn new(name: &str, value: usize) -> Self {
        Self {
            name: Rc::from(name),
            value: Rc::new(Cell::new(value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> usize {
        self.value.get()
    }

    pub fn set(&self, value: usize) {
        self.value.set(value)
    }

    pub fn same_binding(&self, other: &IntSymbol) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for IntSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.get())
    }
}

#[derive(Clone, Debug)]
pub struct SymbolicShape(Vec<IntSymbol>);

impl SymbolicShape {
    pub fn new(symbols: Vec<IntSymbol>) -> Self {
        Self(symbols)
    }

    /// Symbols named `{prefix}{i}` initialised from `dims`.
    pub fn from_dims(prefix: &str, dims: &[usize]) -> Self {
        Self(
            dims.iter()
                .enumerate()
                .map(|(i, d)| IntSymbol::new(&format!("{prefix}{i}"), *d))
                .collect(),
        )
    }

    pub fn symbols(&self) -> &[IntSymbol] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn concrete(&self) -> Vec<usize> {
        self.0.iter().map(IntSymbol::get).collect()
    }

    /// Bind every symbol to the matching entry of `dims`.
    pub fn bind(&self, dims: &[usize]) -> Result<()> {
        if dims.len() != self.0.len() {
            bail_value!(
                "cannot bind symbolic shape of rank {} to concrete shape {dims:?}",
                self.0.len()
            );
        }
        for (sym, d) in self.0.iter().zip(dims) {
            sym.set(*d);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_shapes() {
        assert_eq!(R3::<2, 3, 4>::shape(), vec![2, 3, 4]);
        assert_eq!(R2::<3, 4>::element_count(), 12);
        assert_eq!(numel(&[]), 1);
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
    }

    #[test]
    fn cloned_symbols_share_binding() {
        let a = SymbolicShape::from_dims("s", &[4, 8]);
        let b = a.clone();
        a.bind(&[16, 8]).unwrap();
        assert_eq!(b.concrete(), vec![16, 8]);
        assert!(a.symbols()[0].same_binding(&b.symbols()[0]));
        assert!(a.bind(&[1]).is_err());
    }
}
