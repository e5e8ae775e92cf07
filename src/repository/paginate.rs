//! Offset pagination with and without a total count.

use super::Finder;
use crate::entity::Entity;
use crate::error::Result;
use crate::query::{ColumnRef, Criteria, Order};
use crate::relation::eager;
use serde::Serialize;

/// One page plus totals
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<Entity>,
    pub total: u64,
    pub page_size: u64,
    pub page: u64,
    /// At least 1, even when there are no rows
    pub last_page: u64,
}

/// One page and a hint whether another follows; no count query is issued
#[derive(Debug, Clone, Serialize)]
pub struct SimplePage {
    pub items: Vec<Entity>,
    pub page: u64,
    pub page_size: u64,
    pub next_page: Option<u64>,
}

impl Finder<'_> {
    /// Fetch page `page` (1-based) of `page_size` rows, ordered by primary key
    /// unless an order was given
    pub fn paginate(mut self, page: u64, page_size: u64, criteria: impl Into<Criteria>) -> Result<Page> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let criteria = self.prepare(criteria.into())?;

        let total = self
            .repo
            .connection()
            .count(&self.select(&criteria, Vec::new()))?;

        let items = self.fetch_page(&criteria, page, page_size, page_size)?;
        let last_page = total.div_ceil(page_size).max(1);
        Ok(Page {
            items,
            total,
            page_size,
            page,
            last_page,
        })
    }

    /// Fetch `page_size + 1` rows to learn whether a next page exists
    pub fn simple_paginate(
        mut self,
        page: u64,
        page_size: u64,
        criteria: impl Into<Criteria>,
    ) -> Result<SimplePage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let criteria = self.prepare(criteria.into())?;

        let mut items = self.fetch_page(&criteria, page, page_size, page_size.saturating_add(1))?;
        let next_page = if items.len() as u64 > page_size {
            items.truncate(usize::try_from(page_size).unwrap_or(usize::MAX));
            page.checked_add(1)
        } else {
            None
        };
        Ok(SimplePage {
            items,
            page,
            page_size,
            next_page,
        })
    }

    fn fetch_page(&self, criteria: &Criteria, page: u64, page_size: u64, take: u64) -> Result<Vec<Entity>> {
        let mut query = self.select(criteria, Vec::new());
        if query.order_by.is_empty() {
            query.order_by.push((ColumnRef::new(self.repo.primary_key()), Order::Asc));
        }
        query.limit = Some(take);
        query.offset = Some((page - 1).saturating_mul(page_size));

        let rows = self.repo.connection().select(&query)?;
        let entities = self.repo.hydrate_rows(rows, self.registers_entities());
        if !self.eager.is_empty() {
            eager::load(self.repo, &entities, &self.eager, &self.fields)?;
        }
        Ok(entities)
    }
}
