use std::collections::HashSet;
use std::sync::Arc;

use crate::model::Location;

/// Every location reachable from `root`: the root, all of its descendants and
/// all of its ancestors. Cycles are tolerated.
pub fn locations_in_hierarchy(root: &Arc<dyn Location>) -> Vec<Arc<dyn Location>> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    let mut to_visit = vec![root.clone()];
    while let Some(current) = to_visit.pop() {
        if !seen.insert(current.id().to_string()) {
            continue;
        }
        for child in current.children() {
            to_visit.push(child);
        }
        result.push(current);
    }

    let mut parent = root.parent();
    while let Some(location) = parent {
        if !seen.insert(location.id().to_string()) {
            break;
        }
        parent = location.parent();
        result.push(location);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BasicLocation;

    fn ids(locations: &[Arc<dyn Location>]) -> Vec<String> {
        let mut ids = locations
            .iter()
            .map(|l| l.id().to_string())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[test]
    fn includes_descendants_and_ancestors() {
        let region = BasicLocation::with_id("region", "Region");
        let zone = BasicLocation::with_id("zone", "Zone");
        let host = BasicLocation::with_id("host", "Host");
        let sibling = BasicLocation::with_id("sibling", "Zone");
        BasicLocation::add_child(&region, &zone);
        BasicLocation::add_child(&region, &sibling);
        BasicLocation::add_child(&zone, &host);

        let start: Arc<dyn Location> = zone.clone();
        let found = locations_in_hierarchy(&start);
        assert_eq!(ids(&found), vec!["host", "region", "zone"]);
    }

    #[test]
    fn single_location_yields_itself() {
        let lone: Arc<dyn Location> = BasicLocation::with_id("lone", "Host");
        assert_eq!(ids(&locations_in_hierarchy(&lone)), vec!["lone"]);
    }
}
