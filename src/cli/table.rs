use std::fmt;

use prettytable::{format, Cell, Row as PTableRow, Table};

/// Types that can be rendered as a row in a `bgpd` CLI output table
pub trait TableRow {
    fn columns() -> Vec<&'static str>;
    fn cells(&self) -> Vec<String>;
}

/// Thin wrapper around `prettytable::Table` that derives its header
/// from the first row added, rather than requiring it up front.
pub struct OutputTable {
    inner: Table,
    header_set: bool,
}

impl OutputTable {
    pub fn new() -> Self {
        let mut inner = Table::new();
        inner.set_format(*format::consts::FORMAT_CLEAN);
        Self {
            inner,
            header_set: false,
        }
    }

    pub fn add_row<R: TableRow>(&mut self, row: &R) -> Result<(), fmt::Error> {
        if !self.header_set {
            let titles: Vec<Cell> = R::columns().iter().map(|c| Cell::new(c)).collect();
            self.inner.set_titles(PTableRow::new(titles));
            self.header_set = true;
        }
        let cells: Vec<Cell> = row.cells().iter().map(|c| Cell::new(c)).collect();
        self.inner.add_row(PTableRow::new(cells));
        Ok(())
    }

    pub fn print(&self) {
        if self.header_set {
            self.inner.printstd();
        }
    }
}
