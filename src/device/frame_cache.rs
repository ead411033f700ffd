use {
    ash::vk,
    std::collections::{BTreeMap, HashMap},
};

/// The identity of a cached image view or framebuffer.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum CacheKey {
    ImageView {
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
    },
    Framebuffer {
        render_pass: vk::RenderPass,
        attachments: Vec<vk::ImageView>,
        extent: (u32, u32),
        layers: u32,
    },
}

impl CacheKey {
    fn references_image(&self, target: vk::Image) -> bool {
        matches!(self, CacheKey::ImageView { image, .. } if *image == target)
    }

    fn references_view(&self, view: vk::ImageView) -> bool {
        matches!(
            self,
            CacheKey::Framebuffer { attachments, .. }
                if attachments.contains(&view)
        )
    }
}

/// A cached object. Evicted objects must be destroyed by the caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CachedObject {
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
}

/// A size-bounded cache of image views and framebuffers.
///
/// Entries are keyed by a monotonic index. When the cache is full the entry
/// with the smallest index is evicted. The cache is only touched from the
/// loop thread.
#[derive(Debug)]
pub struct FrameCache {
    capacity: usize,
    next_index: u64,
    entries: BTreeMap<u64, (CacheKey, CachedObject)>,
    lookup: HashMap<CacheKey, u64>,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_index: 0,
            entries: BTreeMap::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedObject> {
        let index = self.lookup.get(key)?;
        self.entries.get(index).map(|(_, object)| *object)
    }

    /// Add an object. Returns its index and whatever was evicted to make
    /// room.
    pub fn add(
        &mut self,
        key: CacheKey,
        object: CachedObject,
    ) -> (u64, Vec<CachedObject>) {
        let mut evicted = Vec::new();
        if let Some(index) = self.lookup.get(&key).copied() {
            evicted.extend(self.remove(index));
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.entries.keys().next().copied() else {
                break;
            };
            log::trace!("Evicting frame cache entry {}", oldest);
            evicted.extend(self.remove(oldest));
        }
        let index = self.next_index;
        self.next_index += 1;
        self.lookup.insert(key.clone(), index);
        self.entries.insert(index, (key, object));
        (index, evicted)
    }

    pub fn remove(&mut self, index: u64) -> Option<CachedObject> {
        let (key, object) = self.entries.remove(&index)?;
        self.lookup.remove(&key);
        Some(object)
    }

    /// Remove every view of `image` and every framebuffer which uses one of
    /// those views.
    pub fn remove_image(&mut self, image: vk::Image) -> Vec<CachedObject> {
        let views = self
            .entries
            .iter()
            .filter(|(_, (key, _))| key.references_image(image))
            .map(|(index, (_, object))| (*index, *object))
            .collect::<Vec<_>>();
        let mut removed = Vec::new();
        for (index, object) in views {
            if let CachedObject::ImageView(view) = object {
                let framebuffers = self
                    .entries
                    .iter()
                    .filter(|(_, (key, _))| key.references_view(view))
                    .map(|(index, _)| *index)
                    .collect::<Vec<_>>();
                for framebuffer in framebuffers {
                    removed.extend(self.remove(framebuffer));
                }
            }
            removed.extend(self.remove(index));
        }
        removed
    }

    pub fn clear(&mut self) -> Vec<CachedObject> {
        self.lookup.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|(_, object)| object)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use {super::*, ash::vk::Handle, pretty_assertions::assert_eq};

    fn view_key(image: u64) -> CacheKey {
        CacheKey::ImageView {
            image: vk::Image::from_raw(image),
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk::Format::B8G8R8A8_UNORM,
            aspect: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn view(raw: u64) -> CachedObject {
        CachedObject::ImageView(vk::ImageView::from_raw(raw))
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut cache = FrameCache::new(2);
        let (first, _) = cache.add(view_key(1), view(10));
        cache.add(view_key(2), view(20));
        let (third, evicted) = cache.add(view_key(3), view(30));
        assert_eq!(first, 0);
        assert_eq!(third, 2);
        assert_eq!(evicted, vec![view(10)]);
        assert_eq!(cache.get(&view_key(1)), None);
        assert_eq!(cache.get(&view_key(3)), Some(view(30)));
    }

    #[test]
    fn removing_an_image_removes_dependent_framebuffers() {
        let mut cache = FrameCache::new(8);
        cache.add(view_key(1), view(10));
        cache.add(view_key(2), view(20));
        let framebuffer =
            CachedObject::Framebuffer(vk::Framebuffer::from_raw(99));
        cache.add(
            CacheKey::Framebuffer {
                render_pass: vk::RenderPass::from_raw(5),
                attachments: vec![vk::ImageView::from_raw(10)],
                extent: (640, 480),
                layers: 1,
            },
            framebuffer,
        );

        let removed = cache.remove_image(vk::Image::from_raw(1));
        assert_eq!(removed, vec![framebuffer, view(10)]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(), vec![view(20)]);
    }
}
