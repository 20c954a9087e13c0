//! Building discovery documents from backend descriptors.
//!
//! Ordering is priority first (lower wins), then name. Within a group the
//! best-priority version is listed first and becomes the preferred version;
//! groups appear in the order of their best-priority member.

use std::collections::HashMap;

use crate::core::types::{ApiGroup, ApiGroupList, BackendDescriptor, GroupVersionForDiscovery};

/// Sort descriptors by priority, breaking ties by name
pub fn sort_by_priority(descriptors: &mut [BackendDescriptor]) {
    descriptors.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

/// Partition descriptors into per-group lists.
///
/// Input is sorted first; each output list keeps that order and the lists
/// are ordered by their first member.
pub fn group_by_group(mut descriptors: Vec<BackendDescriptor>) -> Vec<Vec<BackendDescriptor>> {
    sort_by_priority(&mut descriptors);

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<BackendDescriptor>> = Vec::new();
    for descriptor in descriptors {
        match index.get(&descriptor.group) {
            Some(&position) => groups[position].push(descriptor),
            None => {
                index.insert(descriptor.group.clone(), groups.len());
                groups.push(vec![descriptor]);
            }
        }
    }
    groups
}

/// Discovery entry for a single version of a descriptor
pub fn group_version_for(descriptor: &BackendDescriptor) -> GroupVersionForDiscovery {
    GroupVersionForDiscovery {
        group_version: descriptor.group_version(),
        version: descriptor.version.clone(),
    }
}

/// Group document for descriptors that all share one group.
///
/// Returns `None` when `descriptors` is empty.
pub fn discovery_group(descriptors: &[BackendDescriptor]) -> Option<ApiGroup> {
    let mut sorted = descriptors.to_vec();
    sort_by_priority(&mut sorted);

    let name = sorted.first()?.group.clone();
    let versions = sorted.iter().map(group_version_for).collect();
    Some(ApiGroup::new(name, versions))
}

/// The full `/apis` document: `own_group` first, then every non-legacy group
pub fn aggregated_group_list(own_group: ApiGroup, descriptors: Vec<BackendDescriptor>) -> ApiGroupList {
    let mut groups = vec![own_group];
    groups.extend(
        group_by_group(descriptors)
            .iter()
            .filter(|members| members.first().is_some_and(|first| !first.group.is_empty()))
            .filter_map(|members| discovery_group(members)),
    );
    ApiGroupList::new(groups)
}
