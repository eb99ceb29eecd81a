//! Classification metrics
//!
//! Summary statistics computed once a stream has been fully consumed.

use crate::error::{CoreError, CoreResult};

fn check_lengths(labels: usize, predictions: usize, operation: &'static str) -> CoreResult<()> {
    if labels == 0 {
        return Err(CoreError::EmptyInput { operation });
    }
    if labels != predictions {
        return Err(CoreError::LengthMismatch { labels, predictions });
    }
    Ok(())
}

/// Fraction of correct hard predictions
pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> CoreResult<f64> {
    check_lengths(y_true.len(), y_pred.len(), "accuracy")?;
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    Ok(correct as f64 / y_true.len() as f64)
}

/// Area under the ROC curve for binary labels.
///
/// Rank formulation (Mann–Whitney U) with average ranks for tied scores.
pub fn roc_auc(y_true: &[usize], scores: &[f64]) -> CoreResult<f64> {
    check_lengths(y_true.len(), scores.len(), "roc auc")?;

    let positives = y_true.iter().filter(|&&y| y == 1).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(CoreError::SingleClass { class: y_true[0] });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; ties share the mean rank of their block.
        let avg = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg;
        }
        start = end;
    }

    let rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(y, _)| **y == 1)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    let n = negatives as f64;
    Ok((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Mean and population standard deviation
#[must_use]
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accuracy() {
        assert_relative_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]).unwrap(), 0.75);
        assert!(matches!(accuracy(&[], &[]), Err(CoreError::EmptyInput { .. })));
        assert!(matches!(accuracy(&[0], &[0, 1]), Err(CoreError::LengthMismatch { .. })));
    }

    #[test]
    fn test_roc_auc() {
        assert_relative_eq!(roc_auc(&[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap(), 0.75);
        assert_relative_eq!(roc_auc(&[0, 1], &[0.2, 0.9]).unwrap(), 1.0);
        // all scores tied
        assert_relative_eq!(roc_auc(&[0, 1, 0, 1], &[0.5; 4]).unwrap(), 0.5);
        assert!(matches!(roc_auc(&[1, 1], &[0.1, 0.2]), Err(CoreError::SingleClass { class: 1 })));
    }

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[1.0, 3.0]);
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(std, 1.0);
    }
}
