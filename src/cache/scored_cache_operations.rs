//! Scored Cache Operations - Pure DOP Functions
//!
//! Adds a score per slot on top of the associative cache. New entries go into
//! a free slot when one exists, otherwise they replace the worst-scoring slot,
//! but only if they score strictly better than it.

use super::associative_cache_operations::{
    create_associative_cache, evict_at, get_slot_for_tag, insert_at,
};
use super::cache_data::{ChannelValue, InsertOutcome, ScoredCacheData, Tag};
use crate::error::LodResult;

/// Create a scored cache with every slot free
pub fn create_scored_cache(slot_count: usize) -> ScoredCacheData {
    ScoredCacheData {
        cache: create_associative_cache(slot_count),
        scores: vec![f32::NEG_INFINITY; slot_count],
    }
}

/// Insert `tag` if it is worth a slot
///
/// Returns `Ok(None)` when the cache is full and `score` does not beat the
/// current worst score; nothing is mutated in that case. A tag that is
/// already resident just has its score refreshed.
pub fn scored_insert(
    data: &mut ScoredCacheData,
    score: f32,
    tag: Tag,
    channels: &[(&str, ChannelValue)],
) -> LodResult<Option<InsertOutcome>> {
    if let Some(slot) = get_slot_for_tag(&data.cache, tag) {
        data.scores[slot] = score;
        let outcome = insert_at(&mut data.cache, slot, tag, channels)?;
        return Ok(Some(outcome));
    }

    let Some((slot, worst)) = find_replacement_slot(data) else {
        return Ok(None);
    };

    if data.cache.tags[slot].is_some() && score <= worst {
        return Ok(None);
    }

    let outcome = insert_at(&mut data.cache, slot, tag, channels)?;
    data.scores[slot] = score;
    Ok(Some(outcome))
}

/// First free slot, else the occupied slot with the minimum score
fn find_replacement_slot(data: &ScoredCacheData) -> Option<(usize, f32)> {
    if let Some(free) = data.cache.tags.iter().position(|t| t.is_none()) {
        return Some((free, f32::NEG_INFINITY));
    }
    data.scores
        .iter()
        .copied()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
}

/// Minimum score over occupied slots, negative infinity while any slot is free
pub fn worst_score(data: &ScoredCacheData) -> f32 {
    if data.cache.tags.iter().any(|t| t.is_none()) {
        return f32::NEG_INFINITY;
    }
    data.scores
        .iter()
        .copied()
        .min_by(|a, b| a.total_cmp(b))
        .unwrap_or(f32::NEG_INFINITY)
}

/// Would a new entry with this score get a slot right now
pub fn should_load(data: &ScoredCacheData, score: f32) -> bool {
    worst_score(data) < score
}

/// Recompute every occupied slot's score from its tag
///
/// Tags the scoring function no longer knows drop to negative infinity so
/// they are the next to be replaced, without being removed now.
pub fn sync_scores<F>(data: &mut ScoredCacheData, mut score_for_tag: F)
where
    F: FnMut(Tag) -> Option<f32>,
{
    for (slot, tag) in data.cache.tags.iter().enumerate() {
        data.scores[slot] = match tag {
            Some(tag) => score_for_tag(*tag).unwrap_or(f32::NEG_INFINITY),
            None => f32::NEG_INFINITY,
        };
    }
}

pub fn score_at(data: &ScoredCacheData, slot: usize) -> Option<f32> {
    data.scores.get(slot).copied()
}

/// Free a slot outright, e.g. when the fetch that was meant to fill it failed
pub fn release_slot(data: &mut ScoredCacheData, slot: usize) -> LodResult<Option<Tag>> {
    let evicted = evict_at(&mut data.cache, slot)?;
    data.scores[slot] = f32::NEG_INFINITY;
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::associative_cache_operations::{
        create_channel, directory_is_consistent, occupied_count, read_at, tag_at,
    };
    use crate::cache::cache_data::ElementType;

    fn full_cache(scores: &[f32]) -> ScoredCacheData {
        let mut data = create_scored_cache(scores.len());
        create_channel(&mut data.cache, "payload", ElementType::U32, 1);
        for (i, score) in scores.iter().enumerate() {
            let outcome = scored_insert(
                &mut data,
                *score,
                100 + i as u32,
                &[("payload", ChannelValue::U32(vec![i as u32]))],
            )
            .unwrap()
            .expect("free slot available");
            assert_eq!(outcome.slot, i);
        }
        data
    }

    #[test]
    fn test_free_slots_are_used_first() {
        let mut data = create_scored_cache(3);
        assert_eq!(worst_score(&data), f32::NEG_INFINITY);
        let outcome = scored_insert(&mut data, -5.0, 1, &[]).unwrap().unwrap();
        assert_eq!(outcome, InsertOutcome { slot: 0, evicted: None });
        // still free capacity, so anything loads
        assert!(should_load(&data, -100.0));
    }

    #[test]
    fn test_evicts_minimum_when_better() {
        let mut data = full_cache(&[3.0, 7.0]);
        let outcome = scored_insert(&mut data, 5.0, 999, &[]).unwrap().unwrap();
        assert_eq!(outcome, InsertOutcome { slot: 0, evicted: Some(100) });

        let mut scores = data.scores.clone();
        scores.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(scores, vec![5.0, 7.0]);
        assert!(directory_is_consistent(&data.cache));
    }

    #[test]
    fn test_rejects_when_not_better() {
        let mut data = full_cache(&[3.0, 7.0]);
        assert_eq!(worst_score(&data), 3.0);

        for score in [3.0, 1.0, f32::NEG_INFINITY] {
            let result = scored_insert(
                &mut data,
                score,
                999,
                &[("payload", ChannelValue::U32(vec![42]))],
            )
            .unwrap();
            assert!(result.is_none());
        }

        assert_eq!(data.scores, vec![3.0, 7.0]);
        assert_eq!(tag_at(&data.cache, 0), Some(100));
        assert_eq!(read_at(&data.cache, "payload", 0).unwrap(), ChannelValue::U32(vec![0]));
        assert_eq!(occupied_count(&data.cache), 2);
    }

    #[test]
    fn test_sync_scores_drops_unknown_tags() {
        let mut data = full_cache(&[3.0, 7.0, 1.0]);
        sync_scores(&mut data, |tag| if tag == 101 { Some(2.0) } else { None });
        assert_eq!(data.scores[1], 2.0);
        assert_eq!(data.scores[0], f32::NEG_INFINITY);
        assert_eq!(worst_score(&data), f32::NEG_INFINITY);

        // the stale slot goes first, the live one survives
        let outcome = scored_insert(&mut data, 0.5, 500, &[]).unwrap().unwrap();
        assert_ne!(outcome.slot, 1);
        assert_eq!(tag_at(&data.cache, 1), Some(101));
    }

    #[test]
    fn test_resident_tag_refreshes_score() {
        let mut data = full_cache(&[3.0, 7.0]);
        let outcome = scored_insert(&mut data, 0.1, 101, &[]).unwrap().unwrap();
        assert_eq!(outcome, InsertOutcome { slot: 1, evicted: None });
        assert_eq!(score_at(&data, 1), Some(0.1));
    }

    #[test]
    fn test_release_slot() {
        let mut data = full_cache(&[3.0, 7.0]);
        assert_eq!(release_slot(&mut data, 1).unwrap(), Some(101));
        assert_eq!(worst_score(&data), f32::NEG_INFINITY);
        let outcome = scored_insert(&mut data, 0.0, 8, &[]).unwrap().unwrap();
        assert_eq!(outcome.slot, 1);
    }
}
