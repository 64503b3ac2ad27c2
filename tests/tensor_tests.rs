use briny_grad::tensors::local_index;
use briny_grad::{Error, NdArray, ShapeError};

#[test]
fn buffer_lengths_follow_shape_and_batch() {
    for (shape, batch) in [(vec![3], 1), (vec![2, 3], 4), (vec![1, 5, 2], 3)] {
        let x = NdArray::new(&shape, batch).unwrap();
        let expected = shape.iter().product::<usize>() * batch;
        assert_eq!(x.data().len(), expected);
        assert_eq!(x.grad().len(), expected);
        assert_eq!(x.total_len(), expected);
    }
}

#[test]
fn zero_dimensions_are_rejected() {
    assert!(matches!(
        NdArray::new(&[2, 0], 1),
        Err(Error::Shape(ShapeError::InvalidDimension { .. }))
    ));
    assert!(NdArray::new(&[2], 0).is_err());
}

#[test]
fn addressing_is_batch_then_row_major() {
    let shape = [2, 3, 4];
    assert_eq!(local_index(&shape, 2, 0, &[0, 0, 0]).unwrap(), 0);
    assert_eq!(local_index(&shape, 2, 0, &[1, 2, 3]).unwrap(), 12 + 8 + 3);
    assert_eq!(local_index(&shape, 2, 1, &[0, 1, 0]).unwrap(), 24 + 4);
    assert!(local_index(&shape, 2, 2, &[0, 0, 0]).is_err());
    assert!(local_index(&shape, 2, 0, &[0, 3, 0]).is_err());
}

#[test]
fn reshape_round_trip_keeps_addressing() {
    let data: Vec<_> = (0..24).map(|v| v as briny_grad::Real).collect();
    let x = NdArray::from_vec(&[2, 3, 4], data).unwrap();
    let before: Vec<_> = (0..2)
        .flat_map(|i| (0..3).flat_map(move |j| (0..4).map(move |k| [i, j, k])))
        .map(|idx| x.data()[x.local_index(0, &idx).unwrap()])
        .collect();

    x.reshape(&[-1, 4]).unwrap();
    assert_eq!(x.shape(), [6, 4]);
    x.reshape(&[2, 3, 4]).unwrap();

    let after: Vec<_> = (0..2)
        .flat_map(|i| (0..3).flat_map(move |j| (0..4).map(move |k| [i, j, k])))
        .map(|idx| x.data()[x.local_index(0, &idx).unwrap()])
        .collect();
    assert_eq!(before, after);
}

#[test]
fn reshape_rejects_bad_requests() {
    let x = NdArray::new(&[2, 3], 1).unwrap();
    assert!(matches!(
        x.reshape(&[-1, -1]),
        Err(Error::Shape(ShapeError::MultipleWildcards(_)))
    ));
    assert!(matches!(
        x.reshape(&[4, 2]),
        Err(Error::Shape(ShapeError::ElementCount { .. }))
    ));
    assert!(x.reshape(&[-1, 4]).is_err());
    assert_eq!(x.shape(), [2, 3]);
}

#[test]
fn sum_of_everything_scatters_ones() {
    let x = NdArray::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let s = x.sum(&[]).unwrap();
    assert_eq!(s.to_vec(), vec![21.0]);
    s.backward().unwrap();
    assert_eq!(x.grad_to_vec(), vec![1.0; 6]);
}

#[test]
fn split_then_concatenate_is_identity() {
    let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let x = NdArray::from_vec(&[2, 3], data.clone()).unwrap();
    let parts = x.split(&[1], 1).unwrap();
    assert_eq!(parts[0].shape(), [2, 1]);
    assert_eq!(parts[1].shape(), [2, 2]);

    let z = NdArray::concatenate(&parts[0], &parts[1], 1).unwrap();
    assert_eq!(z.to_vec(), data);

    let seed = vec![0.5, -1.0, 2.0, 0.25, 3.0, -4.0];
    z.grad_mut().copy_from_slice(&seed);
    briny_grad::backprop::propagate(&z).unwrap();
    assert_eq!(x.grad_to_vec(), seed);
    assert_eq!(x.use_count(), 0);
}

#[test]
fn broadcast_sums_gradient_back() {
    let row = NdArray::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
    let b = row.broadcast(&[2, 3]).unwrap();
    assert_eq!(b.to_vec(), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    b.backward().unwrap();
    assert_eq!(row.grad_to_vec(), vec![2.0; 3]);

    let bad = NdArray::new(&[2], 1).unwrap();
    assert!(matches!(bad.broadcast(&[2, 3]), Err(Error::Shape(ShapeError::Broadcast { .. }))));
}

#[test]
fn deep_clone_detaches_buffers() {
    let x = NdArray::from_vec(&[2], vec![1.0, 2.0]).unwrap();
    let y = x.deep_clone();
    y.data_mut()[0] = 9.0;
    assert_eq!(x.to_vec(), vec![1.0, 2.0]);
    assert!(!x.ptr_eq(&y));
    assert!(x.ptr_eq(&x.clone()));
}
