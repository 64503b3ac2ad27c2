use briny_grad::approx::{ApproxEquality, approx_within};
use briny_grad::functions::{Activation, ActivationKind, Add, AddN, Linear, SplitAxis};
use briny_grad::loss::mean_squared_error;
use briny_grad::modelio::{FunctionRegistry, load_dictionary, load_stack, save_dictionary, save_stack};
use briny_grad::optim::{Adam, Optimizer, Sgd};
use briny_grad::{FunctionDictionary, FunctionRef, FunctionStack, KernelManager, NdArray, Real};

fn close(a: &[Real], b: &[Real]) -> bool {
    approx_within(a, b, ApproxEquality::Partial)
}

fn mlp() -> FunctionStack {
    let mut s = FunctionStack::new("mlp");
    s.push(Linear::seeded("l1", 3, 4, 11).unwrap());
    s.push(Activation::new("a1", ActivationKind::Sigmoid));
    s.push(Linear::seeded("l2", 4, 2, 12).unwrap());
    s
}

fn batch() -> NdArray {
    NdArray::from_vec(&[2, 3], vec![0.5, -1.0, 2.0, 1.5, 0.0, -0.5]).unwrap()
}

fn weight_grads(s: &FunctionStack) -> Vec<Vec<Real>> {
    s.parameters().iter().map(NdArray::grad_to_vec).collect()
}

#[test]
fn compression_keeps_the_numbers() {
    let plain = mlp();
    let mut fused = mlp();
    assert_eq!(fused.compress(), 1);
    assert_eq!(fused.len(), 2);

    let x1 = batch();
    let x2 = batch();
    let y1 = plain.forward(&[x1.clone()]).unwrap();
    let y2 = fused.forward(&[x2.clone()]).unwrap();
    assert!(close(&y1[0].to_vec(), &y2[0].to_vec()));

    y1[0].backward().unwrap();
    y2[0].backward().unwrap();
    assert!(close(&x1.grad_to_vec(), &x2.grad_to_vec()));
    for (a, b) in weight_grads(&plain).iter().zip(&weight_grads(&fused)) {
        assert!(close(a, b));
    }
}

#[test]
fn uninitialized_device_falls_back_to_cpu() {
    let manager = KernelManager::disabled();
    let device = FunctionRef::new(Linear::seeded("fc", 3, 2, 5).unwrap());
    let cpu = FunctionRef::new(Linear::seeded("fc", 3, 2, 5).unwrap());
    assert!(!device.set_device_enable(true, &manager));
    assert!(!device.device_enabled());
    assert!(device.set_device_enable(false, &manager));

    let a = device.forward(&[batch()]).unwrap();
    let b = cpu.forward(&[batch()]).unwrap();
    assert_eq!(a[0].to_vec(), b[0].to_vec());

    let mut net = mlp();
    assert!(!net.set_device_enable(true, &manager));
    assert_eq!(net.compress(), 1);
}

#[test]
fn two_layer_matches_hand_computation() {
    let w: Vec<Real> = vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6, -0.7, 0.8, 0.9, 1.0, -1.1, 1.2];
    let b: Vec<Real> = vec![0.05, -0.05, 0.1];
    let xs: Vec<Real> = vec![0.5, -1.0, 2.0, 0.25];

    let mut net = FunctionStack::new("net");
    let fc = net.push(Linear::with_params("fc", 4, 3, w.clone(), b.clone()).unwrap());
    net.push(Activation::new("act", ActivationKind::Tanh));

    let x = NdArray::from_vec(&[4], xs.clone()).unwrap();
    let y = net.forward(&[x.clone()]).unwrap().remove(0);

    let expected: Vec<Real> = (0..3)
        .map(|j| {
            let z: Real = (0..4).map(|i| w[j * 4 + i] * xs[i]).sum::<Real>() + b[j];
            z.tanh()
        })
        .collect();
    assert!(close(&y.to_vec(), &expected));

    y.backward().unwrap();
    let dz: Vec<Real> = expected.iter().map(|t| 1.0 - t * t).collect();
    let gx: Vec<Real> = (0..4)
        .map(|i| (0..3).map(|j| dz[j] * w[j * 4 + i]).sum::<Real>())
        .collect();
    let mut gw = Vec::new();
    for d in &dz {
        gw.extend(xs.iter().map(|xi| d * xi));
    }

    let params = fc.borrow().parameters();
    assert!(close(&x.grad_to_vec(), &gx));
    assert!(close(&params[0].grad_to_vec(), &gw));
    assert!(close(&params[1].grad_to_vec(), &dz));
}

#[test]
fn dictionary_branch_and_merge() {
    let mut g = FunctionDictionary::new("g", &["x"]);
    g.add(Linear::seeded("l0", 3, 3, 3).unwrap(), &["x"], &["h"]).unwrap();
    g.add(Activation::new("relu", ActivationKind::Relu), &["h"], &["p"]).unwrap();
    g.add(Activation::new("tanh", ActivationKind::Tanh), &["h"], &["q"]).unwrap();
    g.add(AddN::new("merge"), &["p", "q"], &["y"]).unwrap();
    assert_eq!(g.output_names(), ["y"]);

    let x = NdArray::from_vec(&[3], vec![0.3, -0.6, 0.9]).unwrap();
    let ys = g.forward(&[x.clone()]).unwrap();
    assert_eq!(ys.len(), 1);
    ys[0].grad_mut().fill(1.0);
    g.backward(&ys).unwrap();

    // same graph wired by hand
    let l0 = FunctionRef::new(Linear::seeded("l0", 3, 3, 3).unwrap());
    let relu = FunctionRef::new(Activation::new("relu", ActivationKind::Relu));
    let tanh = FunctionRef::new(Activation::new("tanh", ActivationKind::Tanh));
    let merge = FunctionRef::new(AddN::new("merge"));
    let x2 = NdArray::from_vec(&[3], vec![0.3, -0.6, 0.9]).unwrap();
    let h = l0.forward(&[x2.clone()]).unwrap().remove(0);
    let p = relu.forward(&[h.clone()]).unwrap().remove(0);
    let q = tanh.forward(&[h]).unwrap().remove(0);
    let y = merge.forward(&[p, q]).unwrap().remove(0);
    y.backward().unwrap();

    assert!(close(&x.grad_to_vec(), &x2.grad_to_vec()));
    assert_eq!(g.parameters().len(), 2);
}

#[test]
fn split_branches_settle_each_output() {
    let w1: Vec<Real> = vec![0.2, -0.4, 0.6, 0.1, -0.3, 0.5];
    let w2: Vec<Real> = vec![-0.7, 0.8, 0.9, -1.0, 0.25, 0.35];
    let b: Vec<Real> = vec![0.1, 0.0, -0.1];
    let xs: Vec<Real> = vec![0.5, -1.5, 2.0, 0.75];
    let layer = |name: &str, w: &[Real]| Linear::with_params(name, 2, 3, w.to_vec(), b.clone()).unwrap();

    let mut g = FunctionDictionary::new("g", &["x"]);
    g.add(SplitAxis::new("split", vec![2], 0), &["x"], &["lo", "hi"]).unwrap();
    let fa = g.add(layer("fa", &w1), &["lo"], &["a"]).unwrap();
    let fb = g.add(layer("fb", &w2), &["hi"], &["b"]).unwrap();
    g.add(Add::new("sum"), &["a", "b"], &["y"]).unwrap();
    assert_eq!(g.output_names(), ["y"]);

    let x = NdArray::from_vec(&[4], xs.clone()).unwrap();
    let ys = g.forward(&[x.clone()]).unwrap();
    ys[0].grad_mut().fill(1.0);
    g.backward(&ys).unwrap();
    assert!(g.functions().iter().all(|f| f.pending() == 0));

    // same graph wired by hand
    let split = FunctionRef::new(SplitAxis::new("split", vec![2], 0));
    let ha = FunctionRef::new(layer("fa", &w1));
    let hb = FunctionRef::new(layer("fb", &w2));
    let sum = FunctionRef::new(Add::new("sum"));
    let x2 = NdArray::from_vec(&[4], xs.clone()).unwrap();
    let mut parts = split.forward(&[x2.clone()]).unwrap();
    let hi = parts.remove(1);
    let lo = parts.remove(0);
    let a = ha.forward(&[lo]).unwrap().remove(0);
    let bb = hb.forward(&[hi]).unwrap().remove(0);
    let y = sum.forward(&[a, bb]).unwrap().remove(0);
    assert!(close(&ys[0].to_vec(), &y.to_vec()));
    y.backward().unwrap();

    assert!(close(&x.grad_to_vec(), &x2.grad_to_vec()));
    for (d, h) in [(&fa, &ha), (&fb, &hb)] {
        let dp = d.borrow().parameters();
        let hp = h.borrow().parameters();
        for (p, q) in dp.iter().zip(&hp) {
            assert!(close(&p.grad_to_vec(), &q.grad_to_vec()));
        }
    }

    // each half of x only sees its own branch
    let column_sums = |w: &[Real]| -> Vec<Real> { (0..2).map(|i| (0..3).map(|j| w[j * 2 + i]).sum()).collect() };
    let mut gx = column_sums(&w1);
    gx.extend(column_sums(&w2));
    assert!(close(&x.grad_to_vec(), &gx));
    let gw1: Vec<Real> = (0..3).flat_map(|_| xs[..2].to_vec()).collect();
    assert!(close(&fa.borrow().parameters()[0].grad_to_vec(), &gw1));
}

#[test]
fn training_reduces_the_loss() {
    let net = mlp();
    net.set_optimizer(&|| Box::new(Sgd::new(0.5)) as Box<dyn Optimizer>);
    let target = NdArray::from_vec(&[2, 2], vec![0.2, -0.1, 0.4, 0.3]).unwrap();

    let mut losses = Vec::new();
    for _ in 0..20 {
        let y = net.forward(&[batch()]).unwrap();
        losses.push(mean_squared_error(&y[0], &target).unwrap());
        net.backward(&y).unwrap();
        net.update().unwrap();
    }
    assert!(losses[19] < losses[0]);
    assert!(net.parameters().iter().all(|p| p.train_count() == 0));
}

#[test]
fn adam_trains_a_dictionary() {
    let mut g = FunctionDictionary::new("g", &["x"]);
    g.add(Linear::seeded("l0", 3, 2, 9).unwrap(), &["x"], &["y"]).unwrap();
    g.set_optimizer(&|| Box::new(Adam::new(0.05)) as Box<dyn Optimizer>);
    let target = NdArray::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();

    let mut losses = Vec::new();
    for _ in 0..30 {
        let y = g.forward(&[batch()]).unwrap();
        losses.push(mean_squared_error(&y[0], &target).unwrap());
        g.backward(&y).unwrap();
        g.update().unwrap();
    }
    assert!(losses[29] < losses[0]);
}

#[test]
fn saved_models_reload_with_the_same_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FunctionRegistry::with_builtins();
    let manager = KernelManager::disabled();

    let mut net = mlp();
    net.compress();
    let expected = net.forward(&[batch()]).unwrap()[0].to_vec();
    assert!(net.functions().iter().all(|f| f.pending() == 1));

    // records held by the saved net are not carried over
    let path = dir.path().join("mlp.bgrd");
    save_stack(&path, &net).unwrap();
    let back = load_stack(&path, &registry, &manager).unwrap();
    assert_eq!(back.len(), 2);
    assert!(back.functions().iter().all(|f| f.pending() == 0));

    let y = back.forward(&[batch()]).unwrap();
    assert_eq!(y[0].to_vec(), expected);
    assert!(back.functions().iter().all(|f| f.pending() == 1));
    back.reset_state();
    assert!(back.functions().iter().all(|f| f.pending() == 0));

    let mut g = FunctionDictionary::new("g", &["x"]);
    g.add(Linear::seeded("l0", 3, 3, 3).unwrap(), &["x"], &["h"]).unwrap();
    g.add(Activation::new("relu", ActivationKind::Relu), &["h"], &["p"]).unwrap();
    g.add(Activation::new("tanh", ActivationKind::Tanh), &["h"], &["q"]).unwrap();
    g.add(AddN::new("merge"), &["p", "q"], &["y"]).unwrap();
    let path = dir.path().join("g.bgrd");
    save_dictionary(&path, &g).unwrap();
    let back = load_dictionary(&path, &registry, &manager).unwrap();
    assert_eq!(back.split_ports(), ["h"]);
    assert_eq!(
        g.forward(&[batch()]).unwrap()[0].to_vec(),
        back.forward(&[batch()]).unwrap()[0].to_vec()
    );
}

#[test]
fn reloaded_models_handle_batched_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FunctionRegistry::with_builtins();
    let manager = KernelManager::disabled();
    let data: Vec<Real> = (0..18).map(|i| i as Real * 0.1 - 0.9).collect();
    let input = || NdArray::from_batch(&[2, 3], 3, data.clone()).unwrap();

    let net = mlp();
    let expected = net.predict(&[input()]).unwrap().remove(0);
    assert_eq!(expected.batch_count(), 3);

    let path = dir.path().join("batched.bgrd");
    save_stack(&path, &net).unwrap();
    let back = load_stack(&path, &registry, &manager).unwrap();
    let y = back.predict(&[input()]).unwrap().remove(0);
    assert_eq!(y.shape(), [2, 2]);
    assert_eq!(y.batch_count(), 3);
    assert_eq!(y.to_vec(), expected.to_vec());
}
