/// Column major view over a contiguous buffer of feature values.
///
/// Column `j` occupies `data[j * rows..(j + 1) * rows]`, so a whole feature can
/// be binned or appended without copying row by row.
///
/// # Type Parameters
/// * `T` - The element type, `f64` for raw features.
#[derive(Debug)]
pub struct Matrix<'a, T> {
    pub data: &'a [T],
    /// Row indices, `0..rows`.
    pub index: Vec<usize>,
    pub rows: usize,
    pub cols: usize,
}

impl<'a, T> Matrix<'a, T> {
    pub fn new(data: &'a [T], rows: usize, cols: usize) -> Self {
        Matrix {
            data,
            index: (0..rows).collect(),
            rows,
            cols,
        }
    }

    /// Value at row `i`, column `j`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> &T {
        &self.data[j * self.rows + i]
    }

    /// All values of column `col`.
    pub fn get_col(&self, col: usize) -> &[T] {
        &self.data[col * self.rows..(col + 1) * self.rows]
    }
}

impl<'a, T: Copy> Matrix<'a, T> {
    /// Copy the selected rows out into a new column-major buffer.
    ///
    /// The result has `rows.len()` rows and `self.cols` columns, in the order given.
    pub fn take_rows(&self, rows: &[usize]) -> Vec<T> {
        let mut out = Vec::with_capacity(rows.len() * self.cols);
        for c in 0..self.cols {
            let col = self.get_col(c);
            out.extend(rows.iter().map(|&r| col[r]));
        }
        out
    }

    /// Copy the matrix with extra columns appended on the right.
    ///
    /// * `extra` - Columns to append, each must have `self.rows` entries.
    pub fn with_columns(&self, extra: &[&[T]]) -> Vec<T> {
        let mut out = Vec::with_capacity((self.cols + extra.len()) * self.rows);
        out.extend_from_slice(&self.data[..self.cols * self.rows]);
        for col in extra {
            debug_assert_eq!(col.len(), self.rows);
            out.extend_from_slice(col);
        }
        out
    }
}
