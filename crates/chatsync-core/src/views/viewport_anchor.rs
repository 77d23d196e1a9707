/// Default distance from the bottom, in pixels, that still counts as "at the bottom".
pub const DEFAULT_EPSILON: f64 = 4.0;

/// One rendered row of the message feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub height: f64,
}

impl FeedItem {
    pub fn new(id: impl Into<String>, height: f64) -> Self {
        Self {
            id: id.into(),
            height,
        }
    }
}

/// An item and where its top edge sits relative to the viewport top.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAnchor {
    pub item_id: String,
    /// `item_top - scroll_top`. Negative when the item starts above the viewport.
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JumpTarget {
    Id(String),
    Index(usize),
}

/// Keeps a virtualized feed visually stable while item heights change.
///
/// Near the bottom the controller follows growth. Scrolled away, it restores
/// an anchor item to the same screen offset after every layout change.
/// All methods that change layout return the new `scroll_top`.
#[derive(Debug, Clone)]
pub struct ViewportAnchorController {
    items: Vec<FeedItem>,
    viewport_height: f64,
    epsilon: f64,
    scroll_top: f64,
    follow_bottom: bool,
    anchor: Option<ScrollAnchor>,
    jump_target: Option<JumpTarget>,
    jump_latched: bool,
}

impl ViewportAnchorController {
    pub fn new(viewport_height: f64, epsilon: f64) -> Self {
        Self {
            items: Vec::new(),
            viewport_height: viewport_height.max(0.0),
            epsilon: epsilon.max(0.0),
            scroll_top: 0.0,
            follow_bottom: true,
            anchor: None,
            jump_target: None,
            jump_latched: false,
        }
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn is_following(&self) -> bool {
        self.follow_bottom
    }

    pub fn anchor(&self) -> Option<&ScrollAnchor> {
        self.anchor.as_ref()
    }

    pub fn content_height(&self) -> f64 {
        self.items.iter().map(|item| item.height).sum()
    }

    pub fn max_scroll_top(&self) -> f64 {
        (self.content_height() - self.viewport_height).max(0.0)
    }

    pub fn is_at_bottom(&self) -> bool {
        self.max_scroll_top() - self.scroll_top <= self.epsilon
    }

    fn item_top(&self, id: &str) -> Option<f64> {
        let mut top = 0.0;
        for item in &self.items {
            if item.id == id {
                return Some(top);
            }
            top += item.height;
        }
        None
    }

    fn index_top(&self, index: usize) -> Option<f64> {
        (index < self.items.len()).then(|| self.items[..index].iter().map(|item| item.height).sum())
    }

    /// Distance of the item's top edge from the viewport top.
    pub fn screen_offset(&self, id: &str) -> Option<f64> {
        self.item_top(id).map(|top| top - self.scroll_top)
    }

    fn clamp(&self, scroll_top: f64) -> f64 {
        scroll_top.clamp(0.0, self.max_scroll_top())
    }

    /// The topmost item at least partially inside the viewport.
    pub fn capture_anchor(&self) -> Option<ScrollAnchor> {
        let mut top = 0.0;
        for item in &self.items {
            let bottom = top + item.height;
            if bottom > self.scroll_top {
                return Some(ScrollAnchor {
                    item_id: item.id.clone(),
                    offset: top - self.scroll_top,
                });
            }
            top = bottom;
        }
        None
    }

    /// Pin a specific item at its current screen offset.
    pub fn anchor_on(&mut self, id: &str) -> Option<ScrollAnchor> {
        let offset = self.screen_offset(id)?;
        let anchor = ScrollAnchor {
            item_id: id.to_string(),
            offset,
        };
        self.anchor = Some(anchor.clone());
        Some(anchor)
    }

    /// The user moved the viewport.
    pub fn on_user_scroll(&mut self, scroll_top: f64) -> f64 {
        self.scroll_top = self.clamp(scroll_top);
        self.settle_mode();
        self.scroll_top
    }

    /// Replace the feed, e.g. after messages were appended or re-measured.
    pub fn update_items(&mut self, items: Vec<FeedItem>) -> f64 {
        self.relayout(|controller| controller.items = items)
    }

    pub fn resize_item(&mut self, id: &str, height: f64) -> f64 {
        self.relayout(|controller| {
            if let Some(item) = controller.items.iter_mut().find(|item| item.id == id) {
                item.height = height.max(0.0);
            }
        })
    }

    pub fn set_viewport_height(&mut self, viewport_height: f64) -> f64 {
        self.relayout(|controller| controller.viewport_height = viewport_height.max(0.0))
    }

    /// Request a one-shot scroll to `target`, applied by the next [`on_render`].
    ///
    /// Asking again for the target that was already applied re-arms it.
    ///
    /// [`on_render`]: ViewportAnchorController::on_render
    pub fn jump_to(&mut self, target: JumpTarget) {
        if self.jump_target.as_ref() != Some(&target) {
            self.jump_target = Some(target);
        }
        self.jump_latched = false;
    }

    /// Called after each render. Returns the new `scroll_top` if a pending jump
    /// was applied, `None` otherwise. A target that is not laid out yet stays pending.
    pub fn on_render(&mut self) -> Option<f64> {
        if self.jump_latched {
            return None;
        }
        let top = match self.jump_target.as_ref()? {
            JumpTarget::Id(id) => self.item_top(id)?,
            JumpTarget::Index(index) => self.index_top(*index)?,
        };
        self.jump_latched = true;
        self.scroll_top = self.clamp(top);
        self.settle_mode();
        Some(self.scroll_top)
    }

    fn settle_mode(&mut self) {
        self.follow_bottom = self.is_at_bottom();
        self.anchor = if self.follow_bottom {
            None
        } else {
            self.capture_anchor()
        };
    }

    fn relayout(&mut self, change: impl FnOnce(&mut Self)) -> f64 {
        let anchor = if self.follow_bottom {
            None
        } else {
            self.anchor.clone().or_else(|| self.capture_anchor())
        };

        change(self);

        if self.follow_bottom {
            self.scroll_top = self.max_scroll_top();
            return self.scroll_top;
        }
        match anchor.and_then(|anchor| Some((self.item_top(&anchor.item_id)?, anchor))) {
            Some((top, anchor)) => {
                self.scroll_top = self.clamp(top - anchor.offset);
                self.anchor = Some(anchor);
            }
            None => {
                self.scroll_top = self.clamp(self.scroll_top);
                self.anchor = self.capture_anchor();
            }
        }
        self.scroll_top
    }
}
