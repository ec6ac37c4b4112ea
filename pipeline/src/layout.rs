// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::filter::Filter;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

thread_local! {
    static REGISTRY: RefCell<Vec<Weak<PipelineLayout>>> = const { RefCell::new(Vec::new()) };
}

/// Immutable template for pipelines: a named, ordered list of filter
/// prototypes plus named sub-layout references.
///
/// Layouts are thread-affine like the pipelines spawned from them; each
/// worker thread builds its own set when its module runs. Construction is
/// the only way to populate a layout, so one can never change after a
/// pipeline has been spawned from it.
pub struct PipelineLayout {
    name: String,
    filters: Vec<Box<dyn Filter>>,
    sub_layouts: HashMap<String, Rc<PipelineLayout>>,
    active: Cell<usize>,
}

impl PipelineLayout {
    /// Creates and registers a layout with the given filter prototypes.
    #[must_use]
    pub fn new(name: impl Into<String>, filters: Vec<Box<dyn Filter>>) -> Rc<Self> {
        Self::with_sub_layouts(name, filters, HashMap::new())
    }

    /// Creates and registers a layout that also references sub-layouts by
    /// name, for filters that spawn auxiliary pipelines.
    #[must_use]
    pub fn with_sub_layouts(
        name: impl Into<String>,
        filters: Vec<Box<dyn Filter>>,
        sub_layouts: HashMap<String, Rc<PipelineLayout>>,
    ) -> Rc<Self> {
        let layout = Rc::new(Self {
            name: name.into(),
            filters,
            sub_layouts,
            active: Cell::new(0),
        });
        REGISTRY.with_borrow_mut(|registry| registry.push(Rc::downgrade(&layout)));
        layout
    }

    /// Layout name or label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a referenced sub-layout.
    #[must_use]
    pub fn sub_layout(&self, name: &str) -> Option<Rc<PipelineLayout>> {
        self.sub_layouts.get(name).cloned()
    }

    /// Number of live pipelines instantiated from this layout.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.get()
    }

    /// Visits every layout created on this thread that is still alive.
    pub fn for_each(mut f: impl FnMut(&Rc<PipelineLayout>)) {
        // Upgrade outside the registry borrow so `f` may itself create
        // layouts.
        let layouts: Vec<_> = REGISTRY.with_borrow_mut(|registry| {
            registry.retain(|weak| weak.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        });
        for layout in &layouts {
            f(layout);
        }
    }

    /// Total number of live pipelines on this thread, across all layouts.
    #[must_use]
    pub fn active_pipeline_count() -> usize {
        let mut count = 0;
        Self::for_each(|layout| count += layout.active());
        count
    }

    pub(crate) fn spawn_filters(&self) -> Vec<Box<dyn Filter>> {
        self.filters.iter().map(|f| f.clone_filter()).collect()
    }

    pub(crate) fn pipeline_spawned(&self) {
        self.active.set(self.active.get() + 1);
    }

    pub(crate) fn pipeline_dropped(&self) {
        self.active.set(self.active.get().saturating_sub(1));
    }
}

impl fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("name", &self.name)
            .field("filters", &self.filters.len())
            .field("active", &self.active.get())
            .finish()
    }
}
